//! The session core: node router, SSH connection pool, terminal and
//! pty registries, forwarding manager, transfer queue, profiler and the
//! reconnection orchestrator, glued together by the [`Station`]
//! singleton and its notification stream.
//!
//! Stable node ids are the only identifiers handed to the presentation
//! layer; the router translates them to volatile connection ids in
//! exactly one place, which is what makes reconnection transparent.

use anyhow::Context;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub mod command;
pub mod config;
pub mod dependents;
pub mod error;
pub mod forward;
pub mod node;
pub mod orchestrator;
pub mod pool;
pub mod profiler;
pub mod ptys;
pub mod router;
pub mod scrollback;
pub mod terminals;
pub mod transfers;
pub mod util;

use config::CoreConfig;
use dependents::{DependentKey, DependentRecord, DependentState, DependentTable};
use error::{CoreError, CoreResult, ErrorKind};
use node::{NodeId, NodeReadiness, NodeRecord, NodeRuntime};
use pool::{ConnectionId, ConnectionPool, ConnectionState};
use profiler::ProfilerSample;
use terminals::TerminalId;
use transfers::TransferProgress;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StationNotification {
    NodeReadiness {
        node_id: NodeId,
        readiness: NodeReadiness,
        generation: u64,
    },
    NodeError {
        node_id: NodeId,
        error: CoreError,
        generation: u64,
    },
    ConnectionStatusChanged {
        connection_id: ConnectionId,
        status: ConnectionState,
        affected_children: Vec<NodeId>,
        timestamp_ms: u64,
    },
    ConnectionBound {
        node_id: NodeId,
        connection_id: ConnectionId,
        generation: u64,
    },
    LinkDown {
        node_id: NodeId,
        affected: Vec<NodeId>,
        generation: u64,
    },
    ParentRecovered {
        node_id: NodeId,
        generation: u64,
    },
    TerminalAttached {
        node_id: NodeId,
        terminal_id: TerminalId,
        generation: u64,
    },
    TerminalDetached {
        node_id: NodeId,
        terminal_id: TerminalId,
        generation: u64,
    },
    TerminalOutput(TerminalId),
    TransferProgress(TransferProgress),
    ProfilerSample {
        node_id: NodeId,
        sample: ProfilerSample,
    },
}

struct NodeSlot {
    record: NodeRecord,
    runtime: NodeRuntime,
}

static SUB_ID: AtomicUsize = AtomicUsize::new(0);

pub struct Station {
    config: CoreConfig,
    nodes: RwLock<HashMap<NodeId, NodeSlot>>,
    node_store: Mutex<vault::NodeStore>,
    group_store: Mutex<vault::GroupStore>,
    vault: Mutex<vault::Vault>,
    pub pool: ConnectionPool,
    pub dependents: Mutex<DependentTable>,
    pub terminals: terminals::TerminalRegistry,
    pub ptys: ptys::PtyRegistry,
    pub forwards: forward::ForwardingManager,
    pub transfers: transfers::TransferQueue,
    pub profilers: profiler::ProfilerRegistry,
    pub orchestrator: orchestrator::Orchestrator,
    /// Guards chain builds and the recovery pipeline; hot-path
    /// operations never wait on it.
    pub(crate) chain_lock: util::FlightLock,
    subscribers: RwLock<HashMap<usize, Box<dyn Fn(StationNotification) -> bool + Send + Sync>>>,
}

lazy_static! {
    static ref STATION: Mutex<Option<Arc<Station>>> = Mutex::new(None);
}

impl Station {
    pub fn init(config: CoreConfig) -> anyhow::Result<Arc<Self>> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let node_store = vault::NodeStore::load(data_dir.join("nodes.json"))?;
        let group_store = vault::GroupStore::load(data_dir.join("groups.json"))?;
        let secret_vault = vault::Vault::new(data_dir.join("vault.oxv"));

        let mut nodes = HashMap::new();
        for record in node_store.records() {
            nodes.insert(
                record.id.clone(),
                NodeSlot {
                    record: record.clone(),
                    runtime: NodeRuntime::default(),
                },
            );
        }

        let station = Arc::new(Self {
            pool: ConnectionPool::new(&config),
            dependents: Mutex::new(DependentTable::new()),
            terminals: terminals::TerminalRegistry::new(&config),
            ptys: ptys::PtyRegistry::new(),
            forwards: forward::ForwardingManager::new(&config),
            transfers: transfers::TransferQueue::new(&config),
            profilers: profiler::ProfilerRegistry::new(&config),
            orchestrator: orchestrator::Orchestrator::new(&config),
            chain_lock: util::FlightLock::new(),
            nodes: RwLock::new(nodes),
            node_store: Mutex::new(node_store),
            group_store: Mutex::new(group_store),
            vault: Mutex::new(secret_vault),
            subscribers: RwLock::new(HashMap::new()),
            config,
        });

        STATION.lock().replace(Arc::clone(&station));
        Ok(station)
    }

    pub fn get() -> Arc<Self> {
        Self::try_get().expect("Station::init must run before Station::get")
    }

    pub fn try_get() -> Option<Arc<Self>> {
        STATION.lock().as_ref().map(Arc::clone)
    }

    /// Orderly shutdown: stop every dependent, close every transport.
    pub async fn drain(&self) {
        self.profilers.stop_all();
        self.forwards.suspend_all_nodes().await;
        self.transfers.cancel_all();
        self.terminals.close_all().await;
        self.ptys.close_all();
        self.pool.close_all().await;
        STATION.lock().take();
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ----- notifications ---------------------------------------------

    /// Subscribe to the event stream.  The callback returns false to
    /// unsubscribe itself.
    pub fn subscribe<F>(&self, subscriber: F) -> usize
    where
        F: Fn(StationNotification) -> bool + Send + Sync + 'static,
    {
        let sub_id = SUB_ID.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .insert(sub_id, Box::new(subscriber));
        sub_id
    }

    pub fn unsubscribe(&self, sub_id: usize) {
        self.subscribers.write().remove(&sub_id);
    }

    pub fn notify(&self, notification: StationNotification) {
        log::trace!("notify: {:?}", notification);
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|_, subscriber| subscriber(notification.clone()));
    }

    // ----- node index ------------------------------------------------

    pub fn node_record(&self, node_id: &str) -> CoreResult<NodeRecord> {
        self.nodes
            .read()
            .get(node_id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| CoreError::not_found(format!("node {node_id}")))
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read();
        let mut records: Vec<NodeRecord> = Vec::with_capacity(nodes.len());
        // Preserve store order rather than map order
        for record in self.node_store.lock().records() {
            if nodes.contains_key(&record.id) {
                records.push(record.clone());
            }
        }
        records
    }

    pub fn create_node(&self, record: NodeRecord) -> CoreResult<()> {
        if let Some(parent) = &record.parent {
            if !self.nodes.read().contains_key(parent) {
                return Err(CoreError::not_found(format!("parent node {parent}")));
            }
        }
        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&record.id) {
                return Err(CoreError::new(
                    ErrorKind::AlreadyExists,
                    format!("node {} already exists", record.id),
                ));
            }
            nodes.insert(
                record.id.clone(),
                NodeSlot {
                    record: record.clone(),
                    runtime: NodeRuntime::default(),
                },
            );
        }
        self.node_store
            .lock()
            .insert(record)
            .map_err(CoreError::internal)?;
        Ok(())
    }

    pub fn remove_node(&self, node_id: &str) -> CoreResult<()> {
        {
            let nodes = self.nodes.read();
            let slot = nodes
                .get(node_id)
                .ok_or_else(|| CoreError::not_found(format!("node {node_id}")))?;
            if slot.runtime.connection_id.is_some() {
                return Err(CoreError::new(
                    ErrorKind::BusyRetryLater,
                    format!("node {node_id} is connected; disconnect it first"),
                ));
            }
            if !self.node_store.lock().children(node_id).is_empty() {
                return Err(CoreError::new(
                    ErrorKind::BusyRetryLater,
                    format!("node {node_id} has children"),
                ));
            }
        }
        self.nodes.write().remove(node_id);
        self.node_store
            .lock()
            .remove(node_id)
            .map_err(CoreError::internal)?;
        Ok(())
    }

    /// Drill-down: create a child node reached through `parent_id`.
    pub fn drill_node(&self, parent_id: &str, mut child: NodeRecord) -> CoreResult<()> {
        self.node_record(parent_id)?;
        child.parent = Some(parent_id.to_string());
        child.origin = node::NodeOrigin::DrillDown;
        self.create_node(child)
    }

    /// Ancestor chain for a node, root first, excluding the node itself.
    pub fn ancestors_of(&self, node_id: &str) -> CoreResult<Vec<NodeId>> {
        let nodes = self.nodes.read();
        let mut chain = vec![];
        let mut cursor = nodes
            .get(node_id)
            .ok_or_else(|| CoreError::not_found(format!("node {node_id}")))?
            .record
            .parent
            .clone();
        while let Some(parent) = cursor {
            let slot = nodes
                .get(&parent)
                .ok_or_else(|| CoreError::not_found(format!("ancestor node {parent}")))?;
            cursor = slot.record.parent.clone();
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Depth of a node in its bastion chain; 0 for a root.
    pub fn node_depth(&self, node_id: &str) -> usize {
        self.ancestors_of(node_id).map(|a| a.len()).unwrap_or(0)
    }

    /// Transitive descendants (store order, parents before children).
    pub fn descendants_of(&self, node_id: &str) -> Vec<NodeId> {
        let store = self.node_store.lock();
        let mut out = vec![];
        let mut frontier = vec![node_id.to_string()];
        while let Some(current) = frontier.pop() {
            for child in store.children(&current) {
                out.push(child.id.clone());
                frontier.push(child.id.clone());
            }
        }
        out
    }

    /// Descendants that currently hold a connection; the set a
    /// link-down event reports as affected.
    pub fn affected_descendants(&self, node_id: &str) -> Vec<NodeId> {
        let nodes = self.nodes.read();
        self.descendants_of(node_id)
            .into_iter()
            .filter(|id| {
                nodes
                    .get(id)
                    .map(|slot| slot.runtime.connection_id.is_some())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn with_runtime<R>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeRuntime) -> R,
    ) -> CoreResult<R> {
        let mut nodes = self.nodes.write();
        let slot = nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::not_found(format!("node {node_id}")))?;
        Ok(f(&mut slot.runtime))
    }

    pub fn node_readiness(&self, node_id: &str) -> CoreResult<NodeReadiness> {
        self.nodes
            .read()
            .get(node_id)
            .map(|slot| slot.runtime.readiness)
            .ok_or_else(|| CoreError::not_found(format!("node {node_id}")))
    }

    pub fn node_connection(&self, node_id: &str) -> Option<ConnectionId> {
        self.nodes
            .read()
            .get(node_id)
            .and_then(|slot| slot.runtime.connection_id)
    }

    fn bump_generation(&self, node_id: &str) -> u64 {
        self.nodes
            .read()
            .get(node_id)
            .map(|slot| slot.runtime.next_generation())
            .unwrap_or(0)
    }

    // ----- event emission helpers ------------------------------------

    pub fn emit_readiness(&self, node_id: &str, readiness: NodeReadiness) {
        if self
            .with_runtime(node_id, |runtime| runtime.readiness = readiness)
            .is_err()
        {
            return;
        }
        let generation = self.bump_generation(node_id);
        self.notify(StationNotification::NodeReadiness {
            node_id: node_id.to_string(),
            readiness,
            generation,
        });
    }

    pub fn emit_node_error(&self, node_id: &str, error: CoreError) {
        let generation = self.bump_generation(node_id);
        self.notify(StationNotification::NodeError {
            node_id: node_id.to_string(),
            error,
            generation,
        });
    }

    pub(crate) fn emit_connection_bound(&self, node_id: &str, connection_id: ConnectionId) {
        let generation = self.bump_generation(node_id);
        self.notify(StationNotification::ConnectionBound {
            node_id: node_id.to_string(),
            connection_id,
            generation,
        });
    }

    // ----- dependents ------------------------------------------------

    /// The single choke point that keeps the pool's reference count in
    /// step with the dependent table.
    pub(crate) fn register_dependent(
        &self,
        key: DependentKey,
        node_id: &str,
    ) -> CoreResult<ConnectionId> {
        let connection_id = self
            .node_connection(node_id)
            .ok_or_else(|| CoreError::new(
                ErrorKind::NotFound,
                format!("node {node_id} has no live connection"),
            ))?;
        self.dependents.lock().insert(DependentRecord {
            key,
            node_id: node_id.to_string(),
            connection_id,
            state: DependentState::Active,
        });
        self.pool.add_ref(connection_id);
        Ok(connection_id)
    }

    pub(crate) fn unregister_dependent(&self, key: &DependentKey) {
        if let Some(record) = self.dependents.lock().remove(key) {
            self.pool.release(record.connection_id);
        }
    }

    /// Invariant check: for every connection in the pool, the
    /// reference count equals the number of dependent records whose
    /// owner is that id.
    pub fn check_refcount_invariant(&self) -> bool {
        let table = self.dependents.lock();
        self.pool.connection_ids().into_iter().all(|connection_id| {
            let pooled = self
                .pool
                .get(connection_id)
                .map(|record| record.refcount())
                .unwrap_or(0);
            pooled == table.refcount(connection_id)
        })
    }

    // ----- vault -----------------------------------------------------

    pub fn unlock_vault(&self, passphrase: &str) -> CoreResult<()> {
        self.vault.lock().unlock(passphrase).map_err(Into::into)
    }

    pub fn vault_save(&self, node_id: &str, secret: &[u8]) -> CoreResult<()> {
        self.node_record(node_id)?;
        self.vault
            .lock()
            .save(node_id, secret)
            .map_err(Into::into)
    }

    pub fn vault_get(&self, node_id: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self
            .vault
            .lock()
            .get(node_id)
            .map(|opt| opt.map(|s| s.to_vec()))?)
    }

    pub fn vault_forget(&self, node_id: &str) -> CoreResult<bool> {
        self.vault.lock().forget(node_id).map_err(Into::into)
    }

    pub fn groups(&self) -> Vec<String> {
        self.group_store.lock().groups().to_vec()
    }

    pub fn add_group(&self, name: &str) -> CoreResult<()> {
        self.group_store.lock().add(name).map_err(CoreError::internal)
    }
}

pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
