//! The secrets vault.
//! On-disk format: `["OXV1"][salt:16][nonce:12][ciphertext||tag]`.
//! The key is derived from the user passphrase with Argon2id and the
//! payload is sealed with ChaCha20-Poly1305.  The portable export is the
//! same byte stream with a SHA-256 checksum appended, so a copy can be
//! verified without knowing the passphrase.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"OXV1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const CHECKSUM_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("vault is locked; unlock it first")]
    Locked,
    #[error("passphrase does not unlock this vault")]
    BadPassphrase,
    #[error("vault file is corrupt: {0}")]
    Corrupt(String),
    #[error("deriving vault key: {0}")]
    Kdf(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Argon2id parameters.  The defaults are the production values;
/// tests substitute something cheap.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // 256 MiB
            memory_kib: 256 * 1024,
            iterations: 4,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    fn derive(&self, passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
        let params = argon2::Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|err| VaultError::Kdf(err.to_string()))?;
        let argon = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        );
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon
            .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
            .map_err(|err| VaultError::Kdf(err.to_string()))?;
        Ok(key)
    }
}

struct Unlocked {
    key: Zeroizing<[u8; KEY_LEN]>,
    salt: [u8; SALT_LEN],
    secrets: BTreeMap<String, Vec<u8>>,
}

pub struct Vault {
    path: PathBuf,
    kdf: KdfParams,
    state: Option<Unlocked>,
}

impl Vault {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            kdf: KdfParams::default(),
            state: None,
        }
    }

    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.is_some()
    }

    /// Unlock the vault with the given passphrase.  If no vault file
    /// exists yet a fresh empty vault is created under that passphrase.
    pub fn unlock(&mut self, passphrase: &str) -> Result<(), VaultError> {
        if !self.path.exists() {
            let mut salt = [0u8; SALT_LEN];
            fill_random(&mut salt)?;
            let key = self.kdf.derive(passphrase, &salt)?;
            self.state = Some(Unlocked {
                key,
                salt,
                secrets: BTreeMap::new(),
            });
            self.persist()?;
            return Ok(());
        }

        let raw = std::fs::read(&self.path)?;
        let parsed = parse_container(&raw)?;
        let key = self.kdf.derive(passphrase, &parsed.salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&parsed.nonce), parsed.sealed)
            .map_err(|_| VaultError::BadPassphrase)?;

        let secrets: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&plaintext)
            .map_err(|err| VaultError::Corrupt(format!("payload is not valid: {err}")))?;

        self.state = Some(Unlocked {
            key,
            salt: parsed.salt,
            secrets,
        });
        Ok(())
    }

    pub fn lock(&mut self) {
        self.state.take();
    }

    pub fn save(&mut self, node_id: &str, secret: &[u8]) -> Result<(), VaultError> {
        let state = self.state.as_mut().ok_or(VaultError::Locked)?;
        state.secrets.insert(node_id.to_string(), secret.to_vec());
        self.persist()
    }

    pub fn get(&self, node_id: &str) -> Result<Option<&[u8]>, VaultError> {
        let state = self.state.as_ref().ok_or(VaultError::Locked)?;
        Ok(state.secrets.get(node_id).map(|v| v.as_slice()))
    }

    /// Remove the secret for a node.  Returns whether one was present.
    pub fn forget(&mut self, node_id: &str) -> Result<bool, VaultError> {
        let state = self.state.as_mut().ok_or(VaultError::Locked)?;
        let removed = state.secrets.remove(node_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<String>, VaultError> {
        let state = self.state.as_ref().ok_or(VaultError::Locked)?;
        Ok(state.secrets.keys().cloned().collect())
    }

    /// Write the portable export: the vault container followed by a
    /// SHA-256 checksum of the container bytes.
    pub fn export<P: AsRef<Path>>(&self, dest: P) -> Result<(), VaultError> {
        if !self.is_unlocked() {
            return Err(VaultError::Locked);
        }
        let container = std::fs::read(&self.path)?;
        let checksum = Sha256::digest(&container);
        let mut file = std::fs::File::create(dest)?;
        file.write_all(&container)?;
        file.write_all(&checksum)?;
        Ok(())
    }

    /// Verify an exported vault's integrity checksum and copy the
    /// container into place.  Does not require the passphrase.
    pub fn import_export<P: AsRef<Path>>(&mut self, src: P) -> Result<(), VaultError> {
        let raw = std::fs::read(src)?;
        if raw.len() < CHECKSUM_LEN {
            return Err(VaultError::Corrupt("export file is truncated".to_string()));
        }
        let (container, checksum) = raw.split_at(raw.len() - CHECKSUM_LEN);
        let computed = Sha256::digest(container);
        if computed.as_slice() != checksum {
            return Err(VaultError::Corrupt(
                "export checksum does not match".to_string(),
            ));
        }
        // Validate the frame before replacing anything
        parse_container(container)?;
        write_atomically(&self.path, container)?;
        self.state.take();
        Ok(())
    }

    fn persist(&mut self) -> Result<(), VaultError> {
        let state = self.state.as_ref().ok_or(VaultError::Locked)?;
        let plaintext = serde_json::to_vec(&state.secrets)
            .map_err(|err| VaultError::Corrupt(err.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(state.key.as_ref()));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|err| VaultError::Corrupt(format!("sealing vault: {err}")))?;

        let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&state.salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        write_atomically(&self.path, &out)?;
        Ok(())
    }
}

struct Container<'a> {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    sealed: &'a [u8],
}

fn parse_container(raw: &[u8]) -> Result<Container, VaultError> {
    if raw.len() < MAGIC.len() + SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(VaultError::Corrupt("file is too short".to_string()));
    }
    if &raw[0..MAGIC.len()] != MAGIC {
        return Err(VaultError::Corrupt(format!(
            "bad magic {:?}",
            &raw[0..MAGIC.len()]
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&raw[MAGIC.len()..MAGIC.len() + SALT_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&raw[MAGIC.len() + SALT_LEN..MAGIC.len() + SALT_LEN + NONCE_LEN]);
    Ok(Container {
        salt,
        nonce,
        sealed: &raw[MAGIC.len() + SALT_LEN + NONCE_LEN..],
    })
}

fn fill_random(buf: &mut [u8]) -> Result<(), VaultError> {
    getrandom::getrandom(buf)
        .map_err(|err| VaultError::Corrupt(format!("gathering entropy: {err}")))
}

fn write_atomically(path: &Path, data: &[u8]) -> Result<(), VaultError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn cheap_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.oxv");

        let mut vault = Vault::new(&path).with_kdf_params(cheap_kdf());
        vault.unlock("hunter2").unwrap();
        vault.save("node-x", b"s3cr3t password").unwrap();
        vault.lock();

        // Fresh instance, as after a relaunch
        let mut vault = Vault::new(&path).with_kdf_params(cheap_kdf());
        assert!(matches!(
            vault.unlock("wrong"),
            Err(VaultError::BadPassphrase)
        ));
        vault.unlock("hunter2").unwrap();
        assert_eq!(vault.get("node-x").unwrap(), Some(&b"s3cr3t password"[..]));
    }

    #[test]
    fn container_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.oxv");

        let mut vault = Vault::new(&path).with_kdf_params(cheap_kdf());
        vault.unlock("pp").unwrap();
        vault.save("n", b"data").unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..4], b"OXV1");
        // magic + salt + nonce + at least a tag
        assert!(raw.len() > 4 + SALT_LEN + NONCE_LEN + TAG_LEN);
    }

    #[test]
    fn forget_removes_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.oxv");

        let mut vault = Vault::new(&path).with_kdf_params(cheap_kdf());
        vault.unlock("pp").unwrap();
        vault.save("a", b"one").unwrap();
        vault.save("b", b"two").unwrap();
        assert!(vault.forget("a").unwrap());
        assert!(!vault.forget("a").unwrap());
        assert_eq!(vault.get("a").unwrap(), None);
        assert_eq!(vault.list().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn locked_vault_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault =
            Vault::new(dir.path().join("vault.oxv")).with_kdf_params(cheap_kdf());
        assert!(matches!(vault.get("x"), Err(VaultError::Locked)));
        assert!(matches!(vault.save("x", b"y"), Err(VaultError::Locked)));
    }

    #[test]
    fn export_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.oxv");
        let export = dir.path().join("vault.export");

        let mut vault = Vault::new(&path).with_kdf_params(cheap_kdf());
        vault.unlock("pp").unwrap();
        vault.save("n", b"data").unwrap();
        vault.export(&export).unwrap();

        let raw = std::fs::read(&export).unwrap();
        let container = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), container.len() + CHECKSUM_LEN);

        // Import back into a second location
        let mut other =
            Vault::new(dir.path().join("copy.oxv")).with_kdf_params(cheap_kdf());
        other.import_export(&export).unwrap();
        other.unlock("pp").unwrap();
        assert_eq!(other.get("n").unwrap(), Some(&b"data"[..]));

        // A flipped byte must be rejected
        let mut broken = std::fs::read(&export).unwrap();
        broken[10] ^= 0xff;
        let corrupted = dir.path().join("broken.export");
        std::fs::write(&corrupted, &broken).unwrap();
        assert!(matches!(
            other.import_export(&corrupted),
            Err(VaultError::Corrupt(_))
        ));
    }
}
