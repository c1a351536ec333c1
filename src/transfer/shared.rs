use crate::error::{Result, ShareError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The peer's own publish table: published name -> file on disk.
///
/// Shared between the control session, which adds entries, and the transfer
/// listener, which resolves download requests against it.
#[derive(Debug, Clone, Default)]
pub struct SharedFiles {
    inner: Arc<RwLock<HashMap<String, PathBuf>>>,
}

impl SharedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, rejecting a reused local file or published name
    pub async fn insert(&self, local_name: &str, published_name: &str) -> Result<()> {
        let mut files = self.inner.write().await;
        let local_path = PathBuf::from(local_name);

        if files.contains_key(published_name) || files.values().any(|p| *p == local_path) {
            return Err(ShareError::AlreadyPublished {
                local_name: local_name.to_string(),
                published_name: published_name.to_string(),
            });
        }

        files.insert(published_name.to_string(), local_path);
        Ok(())
    }

    /// Undo an insert whose announcement never reached the index server
    pub async fn remove(&self, published_name: &str) -> Option<PathBuf> {
        self.inner.write().await.remove(published_name)
    }

    pub async fn lookup(&self, published_name: &str) -> Option<PathBuf> {
        self.inner.read().await.get(published_name).cloned()
    }

    /// All entries, sorted by published name
    pub async fn list(&self) -> Vec<(String, PathBuf)> {
        let files = self.inner.read().await;
        let mut entries: Vec<_> = files.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort();
        entries
    }
}
