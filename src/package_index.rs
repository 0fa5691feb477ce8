/// Package Index Interface
///
/// The repository index parser lives outside this crate; the engine and the
/// proxy front-end only consume lookups against it. A record maps a content
/// hash to the package's filename, size and originating repository.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    pub hash: String,
    pub filename: String,
    pub size: u64,
    pub repo: String,
}

#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn get_by_hash(&self, hash: &str) -> Option<PackageRecord>;
    async fn get_by_path(&self, path: &str) -> Option<PackageRecord>;
    async fn get_by_url(&self, url: &str) -> Option<PackageRecord>;
}

/// In-memory index used by tests and by embedders that build their own
/// index pipeline.
#[derive(Default)]
pub struct MemoryIndex {
    inner: RwLock<IndexTables>,
}

#[derive(Default)]
struct IndexTables {
    by_hash: HashMap<String, PackageRecord>,
    by_path: HashMap<String, String>,
    by_url: HashMap<String, String>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: PackageRecord, path: &str, url: &str) {
        let mut tables = self.inner.write().await;
        tables.by_path.insert(path.to_string(), record.hash.clone());
        tables.by_url.insert(url.to_string(), record.hash.clone());
        tables.by_hash.insert(record.hash.clone(), record);
    }
}

#[async_trait]
impl PackageIndex for MemoryIndex {
    async fn get_by_hash(&self, hash: &str) -> Option<PackageRecord> {
        self.inner.read().await.by_hash.get(hash).cloned()
    }

    async fn get_by_path(&self, path: &str) -> Option<PackageRecord> {
        let tables = self.inner.read().await;
        let hash = tables.by_path.get(path)?;
        tables.by_hash.get(hash).cloned()
    }

    async fn get_by_url(&self, url: &str) -> Option<PackageRecord> {
        let tables = self.inner.read().await;
        let hash = tables.by_url.get(url)?;
        tables.by_hash.get(hash).cloned()
    }
}
