//! Blob storage for uploaded sources and processor results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("upload of {name} failed: {reason}")]
    Upload { name: String, reason: String },

    #[error("delete of {url} failed: {reason}")]
    Delete { url: String, reason: String },

    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` as `name` in `bucket` and return its public URL.
    async fn upload(&self, bytes: Vec<u8>, name: &str, bucket: &str) -> Result<String, BlobError>;

    /// Remove a previously uploaded blob. Deleting a missing blob is not an error.
    async fn delete(&self, url: &str) -> Result<(), BlobError>;
}

#[async_trait]
impl<B> BlobStore for Arc<B>
where
    B: BlobStore + ?Sized,
{
    async fn upload(&self, bytes: Vec<u8>, name: &str, bucket: &str) -> Result<String, BlobError> {
        (**self).upload(bytes, name, bucket).await
    }

    async fn delete(&self, url: &str) -> Result<(), BlobError> {
        (**self).delete(url).await
    }
}

/// Resolves the reference link of a submission to audio bytes.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BlobError>;
}

#[async_trait]
impl<F> ReferenceFetcher for Arc<F>
where
    F: ReferenceFetcher + ?Sized,
{
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BlobError> {
        (**self).fetch(url).await
    }
}

/// Returns the same bytes for every reference URL.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceFetcher {
    audio: Vec<u8>,
}

impl StaticReferenceFetcher {
    pub fn new(audio: Vec<u8>) -> Self {
        Self { audio }
    }
}

#[async_trait]
impl ReferenceFetcher for StaticReferenceFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BlobError> {
        debug!(url, bytes = self.audio.len(), "reference served from memory");
        Ok(self.audio.clone())
    }
}

/// In-process blob store. URLs look like `memory://{bucket}/{name}`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<BlobState>>,
}

#[derive(Debug, Default)]
struct BlobState {
    blobs: HashMap<String, Vec<u8>>,
    fail_uploads: bool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upload fail until switched off again.
    pub fn fail_uploads(&self, fail: bool) {
        self.state().fail_uploads = fail;
    }

    pub fn contains(&self, url: &str) -> bool {
        self.state().blobs.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BlobState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>, name: &str, bucket: &str) -> Result<String, BlobError> {
        let mut state = self.state();
        if state.fail_uploads {
            return Err(BlobError::Upload {
                name: name.to_string(),
                reason: "uploads disabled".to_string(),
            });
        }
        let url = format!("memory://{bucket}/{name}");
        state.blobs.insert(url.clone(), bytes);
        Ok(url)
    }

    async fn delete(&self, url: &str) -> Result<(), BlobError> {
        self.state().blobs.remove(url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_delete() {
        let store = InMemoryBlobStore::new();
        let url = store.upload(vec![1, 2, 3], "a-voice.wav", "bucket").await.unwrap();

        assert_eq!(url, "memory://bucket/a-voice.wav");
        assert_eq!(store.get(&url), Some(vec![1, 2, 3]));

        store.delete(&url).await.unwrap();
        assert!(!store.contains(&url));
        store.delete(&url).await.unwrap();
    }

    #[tokio::test]
    async fn failing_uploads_store_nothing() {
        let store = InMemoryBlobStore::new();
        store.fail_uploads(true);

        let err = store.upload(vec![1], "x.wav", "b").await.unwrap_err();
        assert!(matches!(err, BlobError::Upload { .. }));
        assert!(store.is_empty());
    }
}
