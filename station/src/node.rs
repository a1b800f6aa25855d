//! Node identity and runtime state.  The descriptor (host, user, auth
//! tag, parent linkage) persists in the node store; everything runtime
//! (current connection id, link status, open terminals, the event
//! generation counter) lives here and is cleared on disconnect.

use crate::pool::ConnectionId;
use crate::terminals::TerminalId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
pub use vault::{AuthDescriptor, NodeOrigin, NodeRecord};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeReadiness {
    Idle,
    Connecting,
    Active,
    LinkDown,
    Reconnecting,
    Errored,
}

/// Volatile per-node state.  Owned by the station's node index; the
/// descriptor itself lives in the persistent store.
#[derive(Debug)]
pub struct NodeRuntime {
    pub readiness: NodeReadiness,
    pub connection_id: Option<ConnectionId>,
    pub terminals: HashSet<TerminalId>,
    generation: AtomicU64,
}

impl Default for NodeRuntime {
    fn default() -> Self {
        Self {
            readiness: NodeReadiness::Idle,
            connection_id: None,
            terminals: HashSet::new(),
            generation: AtomicU64::new(0),
        }
    }
}

impl NodeRuntime {
    /// Stamp for the next event about this node.  Strictly increasing,
    /// so stale UI observers can discard out-of-date notifications.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reset everything volatile; invoked when the node disconnects.
    /// The generation counter intentionally survives so post-disconnect
    /// events still order after pre-disconnect ones.
    pub fn clear(&mut self) {
        self.readiness = NodeReadiness::Idle;
        self.connection_id = None;
        self.terminals.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generations_strictly_increase() {
        let runtime = NodeRuntime::default();
        let a = runtime.next_generation();
        let b = runtime.next_generation();
        let c = runtime.next_generation();
        assert!(a < b && b < c);
    }

    #[test]
    fn clear_preserves_generation() {
        let mut runtime = NodeRuntime::default();
        runtime.readiness = NodeReadiness::Active;
        runtime.connection_id = Some(3);
        runtime.next_generation();
        let gen = runtime.current_generation();

        runtime.clear();
        assert_eq!(runtime.readiness, NodeReadiness::Idle);
        assert_eq!(runtime.connection_id, None);
        assert_eq!(runtime.current_generation(), gen);
        assert!(runtime.next_generation() > gen);
    }
}
