//! The reconnection orchestrator: a single-flight, six-phase pipeline
//! (snapshot, drain, transport, rebind, restore, announce) that runs
//! when an ancestor transport fails.  A debouncer folds the burst of
//! link-down observations from a bastion collapse into exactly one
//! recovery rooted at the shallowest affected node.

use crate::dependents::DependentRecord;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::node::{NodeId, NodeReadiness};
use crate::util::CancelToken;
use crate::{config::CoreConfig, Station, StationNotification};
use parking_lot::Mutex;
use smol::Timer;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<NodeId>,
    pub failed: Vec<(NodeId, CoreError)>,
    /// Dependents that could not be restored; their owners recovered.
    pub dependents_errored: usize,
}

impl RecoveryReport {
    pub fn is_full_success(&self) -> bool {
        self.failed.is_empty() && self.dependents_errored == 0
    }
}

struct PendingBatch {
    nodes: HashSet<NodeId>,
}

pub struct Orchestrator {
    node_locks: Mutex<HashSet<NodeId>>,
    pending: Mutex<Option<PendingBatch>>,
    window: Duration,
    attempts: u32,
    backoff: Duration,
}

impl Orchestrator {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            node_locks: Mutex::new(HashSet::new()),
            pending: Mutex::new(None),
            window: config.link_down_debounce(),
            attempts: config.reconnect_attempts,
            backoff: config.reconnect_backoff(),
        }
    }

    /// Fold a link-down observation into the running debounce window,
    /// opening one if none is open.  When the window closes, one
    /// pipeline runs, rooted at the shallowest node observed.
    pub fn observe_link_down(&self, node_id: &str) {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(batch) => {
                batch.nodes.insert(node_id.to_string());
            }
            None => {
                let mut nodes = HashSet::new();
                nodes.insert(node_id.to_string());
                pending.replace(PendingBatch { nodes });

                let window = self.window;
                smol::spawn(async move {
                    Timer::after(window).await;
                    let station = match Station::try_get() {
                        Some(station) => station,
                        None => return,
                    };
                    let batch = station.orchestrator.pending.lock().take();
                    let batch = match batch {
                        Some(batch) => batch,
                        None => return,
                    };
                    let root = shallowest(&station, &batch.nodes);
                    log::debug!(
                        "debounced {} link-down observation(s); recovering from {}",
                        batch.nodes.len(),
                        root
                    );
                    match station
                        .orchestrator
                        .run_recovery(&station, &root, true, CancelToken::new())
                        .await
                    {
                        Ok(report) if report.is_full_success() => {
                            log::info!("recovery of {root} complete");
                        }
                        Ok(report) => {
                            log::warn!(
                                "recovery of {root} partial: {} node(s) failed, \
                                 {} dependent(s) errored",
                                report.failed.len(),
                                report.dependents_errored
                            );
                        }
                        Err(err) => {
                            log::error!("recovery of {root} failed: {err}");
                        }
                    }
                })
                .detach();
            }
        }
    }

    /// Run the pipeline for `root`.  With `wait` the caller is the
    /// scheduled recovery and may sit out a chain build; without it a
    /// busy chain lock surfaces as `BusyRetryLater`.
    pub async fn run_recovery(
        &self,
        station: &Arc<Station>,
        root: &str,
        wait: bool,
        cancel: CancelToken,
    ) -> CoreResult<RecoveryReport> {
        // Per-node lock against duplicate scheduling
        if !self.node_locks.lock().insert(root.to_string()) {
            return Err(CoreError::new(
                ErrorKind::BusyRetryLater,
                format!("recovery for {root} is already scheduled"),
            )
            .with_tag("NODE_LOCK_BUSY"));
        }
        let result = self.run_recovery_locked(station, root, wait, cancel).await;
        self.node_locks.lock().remove(root);
        result
    }

    async fn run_recovery_locked(
        &self,
        station: &Arc<Station>,
        root: &str,
        wait: bool,
        cancel: CancelToken,
    ) -> CoreResult<RecoveryReport> {
        // Idempotence: a healthy node is a no-op
        if node_is_healthy(station, root) {
            log::debug!("recovery requested for healthy node {root}; nothing to do");
            return Ok(RecoveryReport {
                recovered: vec![],
                failed: vec![],
                dependents_errored: 0,
            });
        }

        // The process-wide chain lock: at most one pipeline anywhere
        let guard = loop {
            match station.chain_lock.try_acquire() {
                Some(guard) => break guard,
                None if wait => {
                    Timer::after(Duration::from_millis(250)).await;
                }
                None => {
                    return Err(CoreError::new(
                        ErrorKind::BusyRetryLater,
                        "another chain build or recovery is running",
                    )
                    .with_tag("CHAIN_LOCK_BUSY"));
                }
            }
        };
        let _guard = guard;

        // Affected set, dependency order: root first, then descendants
        // shallowest-first so every child reconnects through a parent
        // that has already been restored.
        let mut affected: Vec<NodeId> = vec![root.to_string()];
        affected.extend(station.affected_descendants(root));
        affected.sort_by_key(|id| station.node_depth(id));
        affected.dedup();

        let mut report = RecoveryReport::default();
        let mut snapshots: Vec<(NodeId, Vec<DependentRecord>)> = vec![];

        // Phase 1: snapshot. Capture dependents and park terminals.
        for node_id in &affected {
            station.emit_readiness(node_id, NodeReadiness::Reconnecting);
            let dependents = station.dependents.lock().by_node(node_id);
            snapshots.push((node_id.clone(), dependents));
            station
                .terminals
                .mark_node_awaiting_reattach(station, node_id);
        }

        if let Err(err) = cancel.check() {
            self.rewind(station, &snapshots);
            return Err(err);
        }

        // Phase 2: drain. Preserve offsets, park forwards and samplers.
        for node_id in &affected {
            station.transfers.drain_node(station, node_id);
            station.forwards.suspend_node(station, node_id).await;
            station.profilers.suspend_node(station, node_id);
        }

        if let Err(err) = cancel.check() {
            self.rewind(station, &snapshots);
            return Err(err);
        }

        // Phases 3-6 per node, root first.  A node that cannot come
        // back takes its subtree with it but never its siblings.
        let mut failed_subtrees: Vec<NodeId> = vec![];
        for node_id in &affected {
            if failed_subtrees
                .iter()
                .any(|failed| is_ancestor_of(station, failed, node_id))
            {
                let err = CoreError::new(
                    ErrorKind::Unreachable,
                    format!("ancestor of {node_id} did not recover"),
                );
                station.emit_readiness(node_id, NodeReadiness::Errored);
                report.failed.push((node_id.clone(), err));
                continue;
            }

            if let Err(err) = cancel.check() {
                self.rewind(station, &snapshots);
                return Err(err);
            }

            // Phase 3: transport
            match self.rebuild_transport(station, node_id).await {
                Ok(connection_id) => {
                    // Phase 4: rebind
                    let rebound = station
                        .dependents
                        .lock()
                        .rebind_node(node_id, connection_id);
                    for _ in 0..rebound {
                        station.pool.add_ref(connection_id);
                    }
                    station.emit_connection_bound(node_id, connection_id);

                    // Phase 5: restore
                    let results = station.terminals.restore_node(station, node_id).await;
                    report.dependents_errored +=
                        results.iter().filter(|(_, r)| r.is_err()).count();

                    for forward in station.forwards.for_node(node_id) {
                        if let Err(err) = station
                            .forwards
                            .rearm(station, forward.forward_id)
                            .await
                        {
                            log::warn!(
                                "forward {} failed to re-arm: {err}",
                                forward.forward_id
                            );
                            report.dependents_errored += 1;
                        }
                    }
                    station.transfers.restore_node(station, node_id);
                    station.profilers.restore_node(station, node_id);

                    // Phase 6: announce
                    station.emit_readiness(node_id, NodeReadiness::Active);
                    let generation = station
                        .with_runtime(node_id, |runtime| runtime.next_generation())
                        .unwrap_or(0);
                    for child in station.descendants_of(node_id) {
                        station.notify(StationNotification::ParentRecovered {
                            node_id: child,
                            generation,
                        });
                    }
                    report.recovered.push(node_id.clone());
                }
                Err(err) if matches!(err.kind, ErrorKind::AuthFailed | ErrorKind::AuthRequired | ErrorKind::HostKeyMismatch) => {
                    // User interaction is needed; the pipeline cannot
                    // make progress on this subtree or its siblings'
                    // trust decisions for them.
                    station.emit_node_error(node_id, err.clone());
                    station.emit_readiness(node_id, NodeReadiness::Errored);
                    report.failed.push((node_id.clone(), err.clone()));
                    return Err(err);
                }
                Err(err) => {
                    station.emit_node_error(node_id, err.clone());
                    station.emit_readiness(node_id, NodeReadiness::Errored);
                    report.failed.push((node_id.clone(), err));
                    failed_subtrees.push(node_id.clone());
                }
            }
        }

        Ok(report)
    }

    /// Phase 3 with bounded retries and exponential backoff.
    async fn rebuild_transport(
        &self,
        station: &Arc<Station>,
        node_id: &str,
    ) -> CoreResult<crate::pool::ConnectionId> {
        // Drop the dead transport first so acquisition starts clean
        if let Some(old) = station.node_connection(node_id) {
            station.pool.force_close(old, "rebuilding transport").await;
        }
        let _ = station.with_runtime(node_id, |runtime| {
            runtime.connection_id = None;
        });

        let mut delay = self.backoff;
        let mut last_err = CoreError::new(ErrorKind::Transient, "no attempt made");
        for attempt in 1..=self.attempts {
            match station.acquire_chain(node_id).await {
                Ok(record) => return Ok(record.connection_id),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    log::debug!(
                        "transport rebuild for {node_id} attempt {attempt}/{}: {err}; \
                         retrying in {delay:?}",
                        self.attempts
                    );
                    Timer::after(delay).await;
                    delay *= 2;
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Cancellation rewind: put dependent records back into the states
    /// captured at snapshot time.
    fn rewind(&self, station: &Arc<Station>, snapshots: &[(NodeId, Vec<DependentRecord>)]) {
        {
            let mut table = station.dependents.lock();
            for (_, records) in snapshots {
                for record in records {
                    table.set_state(&record.key, record.state);
                }
            }
        }
        // The link is still down; say so again
        for (node_id, _) in snapshots {
            station.emit_readiness(node_id, NodeReadiness::LinkDown);
        }
    }
}

fn node_is_healthy(station: &Arc<Station>, node_id: &str) -> bool {
    if !matches!(station.node_readiness(node_id), Ok(NodeReadiness::Active)) {
        return false;
    }
    match station.node_connection(node_id) {
        Some(connection_id) => station
            .pool
            .get(connection_id)
            .map(|record| record.state() == crate::pool::ConnectionState::Active)
            .unwrap_or(false),
        None => false,
    }
}

fn is_ancestor_of(station: &Arc<Station>, ancestor: &str, node_id: &str) -> bool {
    station
        .ancestors_of(node_id)
        .map(|chain| chain.iter().any(|id| id == ancestor))
        .unwrap_or(false)
}

fn shallowest(station: &Arc<Station>, nodes: &HashSet<NodeId>) -> NodeId {
    nodes
        .iter()
        .min_by_key(|id| station.node_depth(id))
        .cloned()
        .expect("debounce batch is never empty")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CoreConfig;
    use crate::node::{AuthDescriptor, NodeOrigin, NodeRecord};
    use causeway_ssh::{Auth, Session, SessionConfig};

    fn record(id: &str, parent: Option<&str>) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            name: id.to_string(),
            host: format!("{id}.test"),
            port: 22,
            username: "u".to_string(),
            auth: AuthDescriptor::Agent,
            parent: parent.map(|p| p.to_string()),
            origin: NodeOrigin::Manual,
            group: None,
        }
    }

    /// A session handle whose transport thread dies immediately; good
    /// enough to populate the pool for bookkeeping-level tests.
    fn dead_session() -> Session {
        let config = SessionConfig::new("127.0.0.1", 1, "nobody", Auth::Agent);
        let (session, _events) = Session::connect(config).unwrap();
        session
    }

    // The station is a process-wide singleton, so the orchestrator
    // behaviors share one test body.
    #[test]
    fn single_flight_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.data_dir = Some(dir.path().to_path_buf());
        let station = Station::init(config).unwrap();

        station.create_node(record("root", None)).unwrap();
        station.create_node(record("mid", Some("root"))).unwrap();
        station.create_node(record("leaf", Some("mid"))).unwrap();

        // Chain exclusivity: with the chain lock held, a non-waiting
        // pipeline is turned away with the documented tag.
        {
            let _guard = station.chain_lock.try_acquire().unwrap();
            let err = smol::block_on(station.orchestrator.run_recovery(
                &station,
                "root",
                false,
                CancelToken::new(),
            ))
            .unwrap_err();
            assert_eq!(err.kind, ErrorKind::BusyRetryLater);
            assert_eq!(err.tag.as_deref(), Some("CHAIN_LOCK_BUSY"));
        }

        // Duplicate scheduling: the per-node lock rejects a second
        // pipeline for the same root.
        assert!(station
            .orchestrator
            .node_locks
            .lock()
            .insert("mid".to_string()));
        let err = smol::block_on(station.orchestrator.run_recovery(
            &station,
            "mid",
            false,
            CancelToken::new(),
        ))
        .unwrap_err();
        assert_eq!(err.tag.as_deref(), Some("NODE_LOCK_BUSY"));
        station.orchestrator.node_locks.lock().remove("mid");

        // Idempotence: a node that is already active with a live
        // pooled connection is a no-op.
        let pooled = station.pool.insert("root", dead_session());
        station
            .with_runtime("root", |runtime| {
                runtime.connection_id = Some(pooled.connection_id);
                runtime.readiness = NodeReadiness::Active;
            })
            .unwrap();
        let report = smol::block_on(station.orchestrator.run_recovery(
            &station,
            "root",
            false,
            CancelToken::new(),
        ))
        .unwrap();
        assert!(report.recovered.is_empty());
        assert!(report.failed.is_empty());

        // Debounce root selection: the shallowest affected node wins.
        let mut nodes = HashSet::new();
        nodes.insert("leaf".to_string());
        nodes.insert("mid".to_string());
        nodes.insert("root".to_string());
        assert_eq!(shallowest(&station, &nodes), "root");

        // Refcounts stay consistent through register/unregister.
        station
            .with_runtime("root", |runtime| {
                runtime.connection_id = Some(pooled.connection_id)
            })
            .unwrap();
        let key = crate::dependents::DependentKey::new(
            crate::dependents::DependentKind::Forward,
            999,
        );
        station.register_dependent(key, "root").unwrap();
        assert_eq!(pooled.refcount(), 1);
        assert!(station.check_refcount_invariant());
        station.unregister_dependent(&key);
        assert_eq!(pooled.refcount(), 0);
        assert!(station.check_refcount_invariant());
    }
}

