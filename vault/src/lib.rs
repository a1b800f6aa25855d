//! Persistent state for the session core: the encrypted secrets vault,
//! the node-descriptor store and the group store.
//! The vault holds per-node secrets (passwords, key passphrases) at rest;
//! the descriptor stores hold everything that is safe in plain text.

pub mod groups;
pub mod nodes;
mod secrets;

pub use groups::GroupStore;
pub use nodes::{AuthDescriptor, NodeOrigin, NodeRecord, NodeStore};
pub use secrets::{KdfParams, Vault, VaultError};
