//! In-memory record store for tests/dev.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use orpheon_core::{AudioProcessingRecord, JobId, ResultUrls, UserId};

use super::{JobRecordStore, RecordStoreError};

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<JobId, AudioProcessingRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, id: JobId, apply: F) -> Result<AudioProcessingRecord, RecordStoreError>
    where
        F: FnOnce(&mut AudioProcessingRecord),
    {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(&id)
            .ok_or(RecordStoreError::NotFound(id))?;
        apply(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl JobRecordStore for InMemoryRecordStore {
    async fn insert(&self, record: &AudioProcessingRecord) -> Result<(), RecordStoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.id) {
            return Err(RecordStoreError::Duplicate(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<AudioProcessingRecord>, RecordStoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn list_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<AudioProcessingRecord>, RecordStoreError> {
        let mut owned: Vec<AudioProcessingRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(owned)
    }

    async fn save_results(
        &self,
        id: JobId,
        urls: &ResultUrls,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        self.update(id, |r| r.apply_results(urls.clone(), at))
    }

    async fn save_manual(
        &self,
        id: JobId,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        self.update(id, |r| r.apply_manual(url.to_string(), at))
    }
}
