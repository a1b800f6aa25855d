//! Folder names used to group nodes in the UI.  Order preserved.

use std::path::PathBuf;

pub struct GroupStore {
    path: PathBuf,
    groups: Vec<String>,
}

impl GroupStore {
    pub fn load<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path = path.into();
        let groups = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self { path, groups })
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn add(&mut self, name: &str) -> anyhow::Result<()> {
        if self.groups.iter().any(|g| g == name) {
            anyhow::bail!("group {name} already exists");
        }
        self.groups.push(name.to_string());
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> anyhow::Result<bool> {
        let before = self.groups.len();
        self.groups.retain(|g| g != name);
        let removed = self.groups.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> anyhow::Result<()> {
        let raw = serde_json::to_vec_pretty(&self.groups)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        let mut store = GroupStore::load(&path).unwrap();
        store.add("production").unwrap();
        store.add("staging").unwrap();
        assert!(store.add("production").is_err());

        let mut store = GroupStore::load(&path).unwrap();
        assert_eq!(store.groups(), &["production", "staging"]);
        assert!(store.remove("production").unwrap());
        assert!(!store.remove("production").unwrap());
    }
}
