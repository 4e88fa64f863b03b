//! Durable job records.
//!
//! The record store is authoritative for job completion: once all three
//! automatic result URLs are stored, the job is complete regardless of what
//! the progress cache says.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use orpheon_core::{AudioProcessingRecord, JobId, ResultUrls, UserId};

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("record already exists: {0}")]
    Duplicate(JobId),

    #[error("record not found: {0}")]
    NotFound(JobId),

    #[error("database error: {0}")]
    Database(String),

    #[error("failed to decode record row: {0}")]
    Decode(String),
}

#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert a new record. An existing id is [`RecordStoreError::Duplicate`].
    async fn insert(&self, record: &AudioProcessingRecord) -> Result<(), RecordStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<AudioProcessingRecord>, RecordStoreError>;

    /// Every record of `owner`, newest first.
    async fn list_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<AudioProcessingRecord>, RecordStoreError>;

    /// Store the three automatic result URLs. Last writer wins.
    async fn save_results(
        &self,
        id: JobId,
        urls: &ResultUrls,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError>;

    async fn save_manual(
        &self,
        id: JobId,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError>;
}

#[async_trait]
impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    async fn insert(&self, record: &AudioProcessingRecord) -> Result<(), RecordStoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<AudioProcessingRecord>, RecordStoreError> {
        (**self).get(id).await
    }

    async fn list_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<AudioProcessingRecord>, RecordStoreError> {
        (**self).list_by_owner(owner).await
    }

    async fn save_results(
        &self,
        id: JobId,
        urls: &ResultUrls,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        (**self).save_results(id, urls, at).await
    }

    async fn save_manual(
        &self,
        id: JobId,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        (**self).save_manual(id, url, at).await
    }
}
