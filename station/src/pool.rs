//! The SSH connection pool: connection id to live transport, with a
//! machine-state, a reference count over dependents and an idle
//! deadline.  The pool sends liveness probes and declares link-down;
//! it never retries on its own — recovery belongs to the orchestrator.

use crate::config::CoreConfig;
use crate::node::{NodeId, NodeReadiness};
use crate::util;
use crate::{Station, StationNotification};
use causeway_ssh::Session;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol::Timer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type ConnectionId = usize;

static CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

pub fn alloc_connection_id() -> ConnectionId {
    CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Active,
    LinkDown,
    Reconnecting,
    Disconnected,
}

pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub node_id: NodeId,
    pub session: Session,
    state: Mutex<ConnectionState>,
    refs: AtomicUsize,
    idle_since: Mutex<Option<Instant>>,
    missed_probes: AtomicU32,
    /// Bumped when the probe task should stand down.
    probe_epoch: AtomicUsize,
}

impl ConnectionRecord {
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn refcount(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    fn probe_epoch(&self) -> usize {
        self.probe_epoch.load(Ordering::SeqCst)
    }

    fn retire_probe(&self) {
        self.probe_epoch.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ConnectionPool {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    keepalive_interval: Duration,
    missed_probe_limit: u32,
    idle_deadline: Duration,
    sweeper_running: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            keepalive_interval: config.keepalive_interval(),
            missed_probe_limit: config.missed_probe_limit,
            idle_deadline: config.idle_deadline(),
            sweeper_running: AtomicBool::new(false),
        }
    }

    /// Take ownership of a freshly authenticated transport.  Spawns the
    /// probe task for it and, on first use, the idle sweeper.
    pub fn insert(&self, node_id: &str, session: Session) -> Arc<ConnectionRecord> {
        let record = Arc::new(ConnectionRecord {
            connection_id: alloc_connection_id(),
            node_id: node_id.to_string(),
            session,
            state: Mutex::new(ConnectionState::Active),
            refs: AtomicUsize::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            missed_probes: AtomicU32::new(0),
            probe_epoch: AtomicUsize::new(0),
        });
        self.connections
            .write()
            .insert(record.connection_id, Arc::clone(&record));

        self.spawn_probe(Arc::clone(&record));
        self.spawn_sweeper();
        record
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.connections.read().get(&connection_id).map(Arc::clone)
    }

    pub fn by_node(&self, node_id: &str) -> Option<Arc<ConnectionRecord>> {
        self.connections
            .read()
            .values()
            .find(|record| record.node_id == node_id)
            .map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }

    /// Borrow the live transport for opening channels.  The reference
    /// count is untouched; dependents account through the registry.
    pub fn borrow(&self, connection_id: ConnectionId) -> Option<Session> {
        self.get(connection_id)
            .filter(|record| record.state() == ConnectionState::Active)
            .map(|record| record.session.clone())
    }

    pub fn add_ref(&self, connection_id: ConnectionId) {
        if let Some(record) = self.get(connection_id) {
            record.refs.fetch_add(1, Ordering::SeqCst);
            record.idle_since.lock().take();
        }
    }

    pub fn release(&self, connection_id: ConnectionId) {
        if let Some(record) = self.get(connection_id) {
            let prev = record.refs.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0, "release without matching add_ref");
            if prev <= 1 {
                record.idle_since.lock().replace(Instant::now());
            }
        }
    }

    /// Tear the transport down.  Dependents are transitioned by the
    /// caller (router / orchestrator); the pool's job ends at the map.
    pub async fn force_close(&self, connection_id: ConnectionId, reason: &str) {
        let record = match self.connections.write().remove(&connection_id) {
            Some(record) => record,
            None => return,
        };
        log::debug!(
            "force_close connection {} for node {}: {}",
            connection_id,
            record.node_id,
            reason
        );
        record.retire_probe();
        record.set_state(ConnectionState::Disconnected);
        if let Some(station) = Station::try_get() {
            station.notify(StationNotification::ConnectionStatusChanged {
                connection_id,
                status: ConnectionState::Disconnected,
                affected_children: station.affected_descendants(&record.node_id),
                timestamp_ms: crate::epoch_millis(),
            });
        }
    }

    pub async fn close_all(&self) {
        for connection_id in self.connection_ids() {
            self.force_close(connection_id, "shutting down").await;
        }
    }

    fn spawn_probe(&self, record: Arc<ConnectionRecord>) {
        let interval = self.keepalive_interval;
        let limit = self.missed_probe_limit;
        let epoch = record.probe_epoch();

        smol::spawn(async move {
            loop {
                Timer::after(interval).await;
                if record.probe_epoch() != epoch {
                    break;
                }
                if record.state() != ConnectionState::Active {
                    break;
                }

                let probe = util::timeout(interval, "keepalive probe", async {
                    record.session.probe().await.map_err(Into::into)
                })
                .await;

                match probe {
                    Ok(()) => {
                        record.missed_probes.store(0, Ordering::SeqCst);
                    }
                    Err(err) => {
                        let missed = record.missed_probes.fetch_add(1, Ordering::SeqCst) + 1;
                        log::debug!(
                            "connection {} missed probe {}/{}: {}",
                            record.connection_id,
                            missed,
                            limit,
                            err
                        );
                        if missed >= limit {
                            mark_link_down(&record);
                            break;
                        }
                    }
                }
            }
            log::trace!("probe task for connection {} retired", record.connection_id);
        })
        .detach();
    }

    fn spawn_sweeper(&self) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = self.idle_deadline;
        smol::spawn(async move {
            loop {
                Timer::after(Duration::from_secs(60)).await;
                let station = match Station::try_get() {
                    Some(station) => station,
                    None => break,
                };
                let expired: Vec<ConnectionId> = station
                    .pool
                    .connections
                    .read()
                    .values()
                    .filter(|record| {
                        let idle_since = *record.idle_since.lock();
                        record.refcount() == 0
                            && idle_since
                                .map(|since| since.elapsed() > deadline)
                                .unwrap_or(false)
                    })
                    .map(|record| record.connection_id)
                    .collect();
                for connection_id in expired {
                    if let Some(record) = station.pool.get(connection_id) {
                        let node_id = record.node_id.clone();
                        station
                            .pool
                            .force_close(connection_id, "idle deadline expired")
                            .await;
                        let _ = station.with_runtime(&node_id, |runtime| runtime.clear());
                        station.emit_readiness(&node_id, NodeReadiness::Idle);
                    }
                }
            }
        })
        .detach();
    }
}

/// Transition a connection to link-down and hand the node to the
/// orchestrator.  Dependents are only marked; nothing is torn down
/// until the recovery pipeline's snapshot/drain phases run.
pub(crate) fn mark_link_down(record: &Arc<ConnectionRecord>) {
    record.set_state(ConnectionState::LinkDown);
    let station = match Station::try_get() {
        Some(station) => station,
        None => return,
    };

    let affected = station.affected_descendants(&record.node_id);
    let generation = station
        .with_runtime(&record.node_id, |runtime| {
            runtime.readiness = NodeReadiness::LinkDown;
            runtime.next_generation()
        })
        .unwrap_or(0);

    station.notify(StationNotification::ConnectionStatusChanged {
        connection_id: record.connection_id,
        status: ConnectionState::LinkDown,
        affected_children: affected.clone(),
        timestamp_ms: crate::epoch_millis(),
    });
    station.notify(StationNotification::LinkDown {
        node_id: record.node_id.clone(),
        affected,
        generation,
    });

    station.orchestrator.observe_link_down(&record.node_id);
}
