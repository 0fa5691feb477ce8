/// Content Cache Interface
///
/// The content-addressed blob cache is an external collaborator; the engine
/// hands it verified artifacts and the serving side reads them back. Only
/// the trait is consumed here, plus an in-memory implementation for tests.
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn has(&self, hash: &str) -> bool;
    async fn put(&self, hash: &str, filename: &str, data: Bytes) -> Result<()>;
    async fn get(&self, hash: &str) -> Option<Bytes>;
}

/// In-memory cache for tests and embedders without a disk store.
#[derive(Default)]
pub struct MemoryCache {
    blobs: RwLock<HashMap<String, (String, Bytes)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn has(&self, hash: &str) -> bool {
        self.blobs.read().await.contains_key(hash)
    }

    async fn put(&self, hash: &str, filename: &str, data: Bytes) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(hash.to_string(), (filename.to_string(), data));
        Ok(())
    }

    async fn get(&self, hash: &str) -> Option<Bytes> {
        self.blobs
            .read()
            .await
            .get(hash)
            .map(|(_, data)| data.clone())
    }
}
