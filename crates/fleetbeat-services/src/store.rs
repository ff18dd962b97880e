//! Identity persistence: store and retrieve serialized identity records by
//! key.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dashmap::DashMap;

use fleetbeat_core::identity::NodeIdentity;

pub trait IdentityStore: Send + Sync {
    fn store(&self, key: &str, record: &[u8]) -> Result<()>;

    /// `Ok(None)` when nothing is stored under `key`.
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn save_identity(&self, key: &str, identity: &NodeIdentity) -> Result<()> {
        self.store(key, &identity.encode()?)
    }

    fn load_identity(&self, key: &str) -> Result<Option<NodeIdentity>> {
        match self.retrieve(key)? {
            Some(bytes) => Ok(Some(NodeIdentity::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Key under which the collector files a node's identity.
pub fn node_key(id: u32) -> String {
    format!("{id:08x}")
}

/// One file per key inside a directory. Writes go to a temp file first and
/// are renamed into place.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    dir: PathBuf,
}

impl FileIdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.id"))
    }
}

impl IdentityStore for FileIdentityStore {
    fn store(&self, key: &str, record: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, record).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: DashMap<String, Vec<u8>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn store(&self, key: &str, record: &[u8]) -> Result<()> {
        self.records.insert(key.to_string(), record.to_vec());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }
}
