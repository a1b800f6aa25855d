//! The node-descriptor store: an ordered list of nodes with parent
//! linkage and authentication-method tags, persisted as JSON.
//! Secrets never appear here; password and passphrase material lives
//! in the vault keyed by node id.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthDescriptor {
    /// Password auth; the password itself is a vault secret.
    Password,
    /// Key file auth.  `encrypted` notes whether a passphrase (stored
    /// in the vault) is needed to decrypt it.
    Key { key_path: String, encrypted: bool },
    Certificate {
        key_path: String,
        cert_path: String,
    },
    Agent,
    /// keyboard-interactive; every prompt goes to the user.
    Interactive,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeOrigin {
    Manual,
    DrillDown,
    AutoRoute,
    ImportedPreset,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthDescriptor,
    /// Parent node id; set for hosts reached through a bastion.
    #[serde(default)]
    pub parent: Option<String>,
    pub origin: NodeOrigin,
    #[serde(default)]
    pub group: Option<String>,
}

/// Ordered collection of node records.  Order is user-visible (it is
/// the sidebar order in the UI) so it is preserved across save/load.
pub struct NodeStore {
    path: PathBuf,
    records: Vec<NodeRecord>,
}

impl NodeStore {
    pub fn load<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn insert(&mut self, record: NodeRecord) -> anyhow::Result<()> {
        if self.get(&record.id).is_some() {
            anyhow::bail!("node {} already exists", record.id);
        }
        self.records.push(record);
        self.save()
    }

    pub fn update(&mut self, record: NodeRecord) -> anyhow::Result<()> {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => {
                *slot = record;
                self.save()
            }
            None => anyhow::bail!("node {} not found", record.id),
        }
    }

    pub fn remove(&mut self, id: &str) -> anyhow::Result<bool> {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        let removed = self.records.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Children of a node, in store order.
    pub fn children(&self, id: &str) -> Vec<&NodeRecord> {
        self.records
            .iter()
            .filter(|r| r.parent.as_deref() == Some(id))
            .collect()
    }

    fn save(&self) -> anyhow::Result<()> {
        let raw = serde_json::to_vec_pretty(&self.records)?;
        write_atomically(&self.path, &raw)?;
        Ok(())
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(id: &str, parent: Option<&str>) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            name: id.to_uppercase(),
            host: format!("{id}.example.com"),
            port: 22,
            username: "u".to_string(),
            auth: AuthDescriptor::Key {
                key_path: "~/.ssh/id_ed25519".to_string(),
                encrypted: false,
            },
            parent: parent.map(|p| p.to_string()),
            origin: NodeOrigin::Manual,
            group: None,
        }
    }

    #[test]
    fn order_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let mut store = NodeStore::load(&path).unwrap();
        store.insert(record("c", None)).unwrap();
        store.insert(record("a", None)).unwrap();
        store.insert(record("b", Some("a"))).unwrap();

        let store = NodeStore::load(&path).unwrap();
        let ids: Vec<&str> = store.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = NodeStore::load(dir.path().join("nodes.json")).unwrap();
        store.insert(record("a", None)).unwrap();
        assert!(store.insert(record("a", None)).is_err());
    }

    #[test]
    fn children_by_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = NodeStore::load(dir.path().join("nodes.json")).unwrap();
        store.insert(record("bastion", None)).unwrap();
        store.insert(record("db", Some("bastion"))).unwrap();
        store.insert(record("web", Some("bastion"))).unwrap();

        let kids: Vec<&str> = store
            .children("bastion")
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(kids, vec!["db", "web"]);
    }

    #[test]
    fn auth_tags_round_trip() {
        let json = serde_json::to_string(&AuthDescriptor::Password).unwrap();
        assert_eq!(json, r#"{"method":"password"}"#);
        let back: AuthDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AuthDescriptor::Password);
    }
}
