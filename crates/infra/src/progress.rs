//! Per-job stage tracking and response caches.
//!
//! Everything here lives in the ephemeral cache. Reads that fail at the
//! transport level degrade to a miss (logged); writes surface [`CacheError`]
//! so the write path's caller learns the cache is out of date.
//!
//! Key layout:
//!
//! | key | value | ttl |
//! |-----|-------|-----|
//! | `audio_processing:{id}:stage` | stage integer | stage ttl |
//! | `audio_processing:{id}` | record JSON | response ttl |
//! | `user:{owner}:audio_processings` | JSON array of the owner's records | response ttl |

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use orpheon_core::{AudioProcessingRecord, JobId, Stage, UserId};

use crate::cache::{CacheError, CacheStore};
use crate::config::PipelineConfig;

pub const DEFAULT_STAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_RESPONSE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub mod keys {
    use orpheon_core::{JobId, UserId};

    pub fn stage(id: JobId) -> String {
        format!("audio_processing:{id}:stage")
    }

    pub fn detail(id: JobId) -> String {
        format!("audio_processing:{id}")
    }

    pub fn owner_list(owner: UserId) -> String {
        format!("user:{owner}:audio_processings")
    }
}

#[derive(Clone)]
pub struct ProgressStore {
    cache: Arc<dyn CacheStore>,
    stage_ttl: Duration,
    response_ttl: Duration,
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore")
            .field("stage_ttl", &self.stage_ttl)
            .field("response_ttl", &self.response_ttl)
            .finish_non_exhaustive()
    }
}

impl ProgressStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            stage_ttl: DEFAULT_STAGE_TTL,
            response_ttl: DEFAULT_RESPONSE_CACHE_TTL,
        }
    }

    /// Store with the stage and response TTLs taken from `config`.
    pub fn from_config(cache: Arc<dyn CacheStore>, config: &PipelineConfig) -> Self {
        Self::new(cache)
            .with_stage_ttl(config.stage_ttl)
            .with_response_ttl(config.response_cache_ttl)
    }

    pub fn with_stage_ttl(mut self, ttl: Duration) -> Self {
        self.stage_ttl = ttl;
        self
    }

    pub fn with_response_ttl(mut self, ttl: Duration) -> Self {
        self.response_ttl = ttl;
        self
    }

    /// Cached stage, if any. A transport failure or a corrupt entry reads as
    /// a miss.
    pub async fn get_stage(&self, id: JobId) -> Option<Stage> {
        let raw = self.read(&keys::stage(id)).await?;
        match raw.parse::<Stage>() {
            Ok(stage) => Some(stage),
            Err(e) => {
                warn!(job_id = %id, value = %raw, error = %e, "ignoring corrupt stage entry");
                None
            }
        }
    }

    pub async fn set_stage(&self, id: JobId, stage: Stage) -> Result<(), CacheError> {
        self.cache
            .set(&keys::stage(id), stage.to_string(), Some(self.stage_ttl))
            .await?;
        debug!(job_id = %id, %stage, "stage stored");
        Ok(())
    }

    pub async fn clear_stage(&self, id: JobId) -> Result<(), CacheError> {
        self.cache.delete(&keys::stage(id)).await
    }

    pub async fn cached_detail(&self, id: JobId) -> Option<AudioProcessingRecord> {
        self.read_json(&keys::detail(id)).await
    }

    pub async fn cache_detail(&self, record: &AudioProcessingRecord) -> Result<(), CacheError> {
        self.write_json(&keys::detail(record.id), record).await
    }

    pub async fn cached_library(&self, owner: UserId) -> Option<Vec<AudioProcessingRecord>> {
        self.read_json(&keys::owner_list(owner)).await
    }

    pub async fn cache_library(
        &self,
        owner: UserId,
        records: &[AudioProcessingRecord],
    ) -> Result<(), CacheError> {
        self.write_json(&keys::owner_list(owner), &records).await
    }

    pub async fn invalidate_library(&self, owner: UserId) -> Result<(), CacheError> {
        self.cache.delete(&keys::owner_list(owner)).await
    }

    /// Drop both response caches a record change makes stale.
    pub async fn invalidate(&self, id: JobId, owner: UserId) -> Result<(), CacheError> {
        self.cache.delete(&keys::detail(id)).await?;
        self.invalidate_library(owner).await
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "ignoring undecodable cache entry");
                None
            }
        }
    }

    async fn write_json<T: serde::Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        let raw =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.cache.set(key, raw, Some(self.response_ttl)).await
    }
}
