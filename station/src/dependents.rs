//! The uniform dependent model: a terminal, an sftp session, a forward
//! and a profiler are all records that require a live connection.  The
//! table here is the source of truth for connection reference counts
//! and for the set a recovery pipeline must snapshot.

use crate::node::NodeId;
use crate::pool::ConnectionId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependentKind {
    Terminal,
    Sftp,
    Forward,
    Profiler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependentKey {
    pub kind: DependentKind,
    pub id: usize,
}

impl DependentKey {
    pub fn new(kind: DependentKind, id: usize) -> Self {
        Self { kind, id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentState {
    Active,
    /// Between link-down and a successful restore.
    AwaitingReattach,
    Suspended,
    Errored,
}

#[derive(Debug, Clone)]
pub struct DependentRecord {
    pub key: DependentKey,
    pub node_id: NodeId,
    pub connection_id: ConnectionId,
    pub state: DependentState,
}

#[derive(Debug, Default)]
pub struct DependentTable {
    records: HashMap<DependentKey, DependentRecord>,
}

impl DependentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: DependentRecord) {
        self.records.insert(record.key, record);
    }

    pub fn remove(&mut self, key: &DependentKey) -> Option<DependentRecord> {
        self.records.remove(key)
    }

    pub fn get(&self, key: &DependentKey) -> Option<&DependentRecord> {
        self.records.get(key)
    }

    pub fn set_state(&mut self, key: &DependentKey, state: DependentState) -> bool {
        match self.records.get_mut(key) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// The exact number of dependent records owned by a connection.
    /// Invariant: this equals the pool's reference count for that id.
    pub fn refcount(&self, connection_id: ConnectionId) -> usize {
        self.records
            .values()
            .filter(|r| r.connection_id == connection_id)
            .count()
    }

    pub fn by_connection(&self, connection_id: ConnectionId) -> Vec<DependentRecord> {
        self.records
            .values()
            .filter(|r| r.connection_id == connection_id)
            .cloned()
            .collect()
    }

    pub fn by_node(&self, node_id: &NodeId) -> Vec<DependentRecord> {
        self.records
            .values()
            .filter(|r| &r.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Point every record of a node at a fresh connection id; the
    /// rebind step of recovery.
    pub fn rebind_node(&mut self, node_id: &NodeId, connection_id: ConnectionId) -> usize {
        let mut rebound = 0;
        for record in self.records.values_mut() {
            if &record.node_id == node_id {
                record.connection_id = connection_id;
                rebound += 1;
            }
        }
        rebound
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(kind: DependentKind, id: usize) -> DependentKey {
        DependentKey::new(kind, id)
    }

    fn record(kind: DependentKind, id: usize, node: &str, conn: ConnectionId) -> DependentRecord {
        DependentRecord {
            key: key(kind, id),
            node_id: node.to_string(),
            connection_id: conn,
            state: DependentState::Active,
        }
    }

    #[test]
    fn refcount_tracks_records() {
        let mut table = DependentTable::new();
        table.insert(record(DependentKind::Terminal, 1, "b", 7));
        table.insert(record(DependentKind::Terminal, 2, "b", 7));
        table.insert(record(DependentKind::Forward, 1, "b", 7));
        table.insert(record(DependentKind::Sftp, 1, "c", 8));

        assert_eq!(table.refcount(7), 3);
        assert_eq!(table.refcount(8), 1);

        table.remove(&key(DependentKind::Terminal, 2));
        assert_eq!(table.refcount(7), 2);
    }

    #[test]
    fn terminal_and_forward_ids_are_distinct_spaces() {
        let mut table = DependentTable::new();
        table.insert(record(DependentKind::Terminal, 1, "b", 7));
        table.insert(record(DependentKind::Forward, 1, "b", 7));
        assert_eq!(table.refcount(7), 2);
    }

    #[test]
    fn rebind_moves_all_node_records() {
        let mut table = DependentTable::new();
        table.insert(record(DependentKind::Terminal, 1, "b", 7));
        table.insert(record(DependentKind::Profiler, 1, "b", 7));
        table.insert(record(DependentKind::Terminal, 9, "other", 7));

        assert_eq!(table.rebind_node(&"b".to_string(), 12), 2);
        assert_eq!(table.refcount(12), 2);
        assert_eq!(table.refcount(7), 1);
    }

    #[test]
    fn state_transitions() {
        let mut table = DependentTable::new();
        table.insert(record(DependentKind::Terminal, 1, "b", 7));
        assert!(table.set_state(&key(DependentKind::Terminal, 1), DependentState::AwaitingReattach));
        assert_eq!(
            table.get(&key(DependentKind::Terminal, 1)).unwrap().state,
            DependentState::AwaitingReattach
        );
        assert!(!table.set_state(&key(DependentKind::Terminal, 99), DependentState::Errored));
    }
}
