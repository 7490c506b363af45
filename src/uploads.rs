use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MessagingError, MessagingResult};

/// File/object storage collaborator: takes attachment bytes, hands back a URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, original_name: &str, bytes: &[u8]) -> MessagingResult<String>;
}

/// Writes uploads under a directory and returns `file://` URLs.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(root: impl AsRef<Path>) -> MessagingResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(LocalObjectStore { root })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, original_name: &str, bytes: &[u8]) -> MessagingResult<String> {
        let path = self.root.join(stored_name(original_name)?);
        tokio::fs::write(&path, bytes).await?;
        debug!("stored {} bytes at {}", bytes.len(), path.display());
        Ok(format!("file://{}", path.display()))
    }
}

/// Keeps uploads in memory; URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(url).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, original_name: &str, bytes: &[u8]) -> MessagingResult<String> {
        let url = format!("memory://{}", stored_name(original_name)?);
        self.objects.lock().await.insert(url.clone(), bytes.to_vec());
        Ok(url)
    }
}

/// Unique object name that keeps the original extension.
fn stored_name(original_name: &str) -> MessagingResult<String> {
    let file_name = Path::new(original_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| MessagingError::Validation(format!("invalid file name '{original_name}'")))?;
    Ok(match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    })
}
