//! Submission saga: create record → initialize stage → upload → publish →
//! invalidate list cache.
//!
//! Steps before and including `CreateRecord` fail the submission outright
//! with nothing to undo. `InitializeStage` and `InvalidateListCache` are
//! cache writes; their failure is logged and reported but does not stop the
//! submission. A failed `UploadArtifacts` or `Publish` runs the compensations
//! in reverse order of the work done:
//!
//! | work done          | compensation            |
//! |--------------------|-------------------------|
//! | artifact uploaded  | delete the blob         |
//! | stage set to 0     | clear the stage entry   |
//! | record created     | invalidate owner list   |
//!
//! The record itself is kept: a job whose publish failed stays
//! pending-but-undispatched with no stage entry.

use serde::Serialize;
use tracing::warn;

use orpheon_core::{JobId, UserId};

use crate::blob::BlobStore;
use crate::progress::ProgressStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStep {
    CreateRecord,
    InitializeStage,
    UploadArtifacts,
    Publish,
    InvalidateListCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Compensation {
    DeleteArtifact { url: String },
    ClearStage,
    InvalidateListCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationResult {
    pub compensation: Compensation,
    /// `None` when the compensation succeeded.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SagaReport {
    pub completed: Vec<SubmissionStep>,
    pub compensations: Vec<CompensationResult>,
    /// Non-fatal step failures, as `step: error`.
    pub warnings: Vec<String>,
}

impl SagaReport {
    pub fn is_completed(&self, step: SubmissionStep) -> bool {
        self.completed.contains(&step)
    }

    pub fn is_compensated(&self) -> bool {
        !self.compensations.is_empty()
    }
}

/// Tracks the work done by one submission so it can be undone.
#[derive(Debug)]
pub(crate) struct SubmissionSaga {
    job_id: JobId,
    owner: UserId,
    uploaded: Vec<String>,
    stage_initialized: bool,
    report: SagaReport,
}

impl SubmissionSaga {
    pub(crate) fn new(job_id: JobId, owner: UserId) -> Self {
        Self {
            job_id,
            owner,
            uploaded: Vec::new(),
            stage_initialized: false,
            report: SagaReport::default(),
        }
    }

    pub(crate) fn complete(&mut self, step: SubmissionStep) {
        if step == SubmissionStep::InitializeStage {
            self.stage_initialized = true;
        }
        self.report.completed.push(step);
    }

    pub(crate) fn warn(&mut self, step: SubmissionStep, error: &dyn std::fmt::Display) {
        warn!(job_id = %self.job_id, ?step, error = %error, "submission step failed; continuing");
        self.report.warnings.push(format!("{step:?}: {error}"));
    }

    pub(crate) fn track_upload(&mut self, url: String) {
        self.uploaded.push(url);
    }

    /// Undo the recorded work, newest first. Every compensation is attempted
    /// even if an earlier one failed.
    pub(crate) async fn compensate(
        &mut self,
        blobs: &dyn BlobStore,
        progress: &ProgressStore,
    ) {
        while let Some(url) = self.uploaded.pop() {
            let result = blobs.delete(&url).await.map_err(|e| e.to_string());
            self.record(Compensation::DeleteArtifact { url }, result);
        }

        if self.stage_initialized {
            let result = progress.clear_stage(self.job_id).await.map_err(|e| e.to_string());
            self.record(Compensation::ClearStage, result);
        }

        if self.report.is_completed(SubmissionStep::CreateRecord) {
            let result = progress
                .invalidate_library(self.owner)
                .await
                .map_err(|e| e.to_string());
            self.record(Compensation::InvalidateListCache, result);
        }
    }

    fn record(&mut self, compensation: Compensation, result: Result<(), String>) {
        let error = result.err();
        if let Some(e) = &error {
            warn!(job_id = %self.job_id, ?compensation, error = %e, "compensation failed");
        }
        self.report.compensations.push(CompensationResult {
            compensation,
            error,
        });
    }

    pub(crate) fn into_report(self) -> SagaReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use orpheon_core::Stage;

    use crate::blob::InMemoryBlobStore;
    use crate::cache::InMemoryCache;

    #[tokio::test]
    async fn compensation_undoes_work_in_reverse() {
        let id = JobId::from_uuid(uuid::Uuid::from_u128(3));
        let owner = UserId::new();
        let blobs = InMemoryBlobStore::new();
        let progress = ProgressStore::new(Arc::new(InMemoryCache::new()));

        let voice = blobs.upload(vec![1], "v.wav", "b").await.unwrap();
        let reference = blobs.upload(vec![2], "r.mp3", "b").await.unwrap();
        progress.set_stage(id, Stage::PENDING).await.unwrap();

        let mut saga = SubmissionSaga::new(id, owner);
        saga.complete(SubmissionStep::CreateRecord);
        saga.complete(SubmissionStep::InitializeStage);
        saga.track_upload(voice.clone());
        saga.track_upload(reference.clone());

        saga.compensate(&blobs, &progress).await;
        let report = saga.into_report();

        assert!(blobs.is_empty());
        assert_eq!(progress.get_stage(id).await, None);
        let done: Vec<_> = report.compensations.iter().map(|c| c.compensation.clone()).collect();
        assert_eq!(
            done,
            vec![
                Compensation::DeleteArtifact { url: reference },
                Compensation::DeleteArtifact { url: voice },
                Compensation::ClearStage,
                Compensation::InvalidateListCache,
            ]
        );
        assert!(report.compensations.iter().all(|c| c.error.is_none()));
    }

    #[tokio::test]
    async fn stage_left_alone_when_never_initialized() {
        let id = JobId::from_uuid(uuid::Uuid::from_u128(4));
        let blobs = InMemoryBlobStore::new();
        let progress = ProgressStore::new(Arc::new(InMemoryCache::new()));

        let mut saga = SubmissionSaga::new(id, UserId::new());
        saga.complete(SubmissionStep::CreateRecord);
        saga.warn(SubmissionStep::InitializeStage, &"cache offline");
        saga.compensate(&blobs, &progress).await;
        let report = saga.into_report();

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(
            report.compensations,
            vec![CompensationResult {
                compensation: Compensation::InvalidateListCache,
                error: None,
            }]
        );
    }
}
