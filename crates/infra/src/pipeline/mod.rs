//! Pipeline orchestrator: submission, read paths and processor callbacks.
//!
//! Every collaborator is an injected handle: the record store is
//! authoritative for job data, the progress store caches stages and
//! responses, the publisher dispatches jobs and the blob store holds audio.

pub mod saga;
pub mod view;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use orpheon_core::{
    validate_reference_url, AudioProcessingRecord, DomainError, JobId, NewAudioProcessing,
    Priority, ResultUrls, SourceFile, Stage, SubmissionLimits, UserId,
};
use orpheon_messaging::{Broker, JobMessage, JobPayload};

use crate::blob::{BlobError, BlobStore, ReferenceFetcher};
use crate::cache::{CacheError, CacheStore};
use crate::config::PipelineConfig;
use crate::jobs::{PublishError, Publisher};
use crate::progress::ProgressStore;
use crate::records::{JobRecordStore, RecordStoreError};

pub use saga::{Compensation, CompensationResult, SagaReport, SubmissionStep};
pub use view::{AudioProcessingView, LibraryPage, LIBRARY_PAGE_SIZE};

use saga::SubmissionSaga;

pub const DEFAULT_BUCKET: &str = "audio-processing";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("job already submitted: {0}")]
    Duplicate(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Records(RecordStoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("submission failed at {step:?}: {source}")]
    SubmissionFailed {
        step: SubmissionStep,
        report: SagaReport,
        source: Box<PipelineError>,
    },
}

impl From<RecordStoreError> for PipelineError {
    fn from(err: RecordStoreError) -> Self {
        match err {
            RecordStoreError::Duplicate(id) => PipelineError::Duplicate(id),
            RecordStoreError::NotFound(id) => PipelineError::NotFound(id),
            other => PipelineError::Records(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub owner: UserId,
    pub submitted_at: DateTime<Utc>,
    pub voice: SourceFile,
    pub instrument: Option<SourceFile>,
    pub reference_url: String,
    pub priority: Priority,
    pub is_denoise: bool,
    pub is_autotune: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub record: AudioProcessingRecord,
    pub message: JobMessage,
    pub report: SagaReport,
}

/// A file handed back by the processor or by a manual override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFiles {
    pub standard: UploadedFile,
    pub dynamic: UploadedFile,
    pub smooth: UploadedFile,
}

pub struct PipelineOrchestrator {
    records: Arc<dyn JobRecordStore>,
    progress: ProgressStore,
    publisher: Publisher,
    blobs: Arc<dyn BlobStore>,
    references: Arc<dyn ReferenceFetcher>,
    limits: SubmissionLimits,
    bucket: String,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("progress", &self.progress)
            .field("limits", &self.limits)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        progress: ProgressStore,
        publisher: Publisher,
        blobs: Arc<dyn BlobStore>,
        references: Arc<dyn ReferenceFetcher>,
    ) -> Self {
        Self {
            records,
            progress,
            publisher,
            blobs,
            references,
            limits: SubmissionLimits::default(),
            bucket: DEFAULT_BUCKET.to_string(),
        }
    }

    /// Orchestrator over the given stores with TTLs and bucket from `config`.
    pub fn from_config(
        config: &PipelineConfig,
        records: Arc<dyn JobRecordStore>,
        cache: Arc<dyn CacheStore>,
        broker: Arc<dyn Broker>,
        blobs: Arc<dyn BlobStore>,
        references: Arc<dyn ReferenceFetcher>,
    ) -> Self {
        Self::new(
            records,
            ProgressStore::from_config(cache, config),
            Publisher::new(broker),
            blobs,
            references,
        )
        .with_bucket(config.blob_bucket.clone())
    }

    /// Connect the Postgres record store and the Redis cache named in
    /// `config`, creating the table if it is missing.
    #[cfg(feature = "redis")]
    #[instrument(skip_all, err)]
    pub async fn connect(
        config: &PipelineConfig,
        broker: Arc<dyn Broker>,
        blobs: Arc<dyn BlobStore>,
        references: Arc<dyn ReferenceFetcher>,
    ) -> Result<Self, PipelineError> {
        let records = crate::records::PostgresRecordStore::connect(&config.database_url).await?;
        records.ensure_schema().await?;
        let cache = crate::cache::RedisCache::connect(&config.redis_url).await?;
        info!(bucket = %config.blob_bucket, "pipeline stores connected");

        Ok(Self::from_config(
            config,
            Arc::new(records),
            Arc::new(cache),
            broker,
            blobs,
            references,
        ))
    }

    pub fn with_limits(mut self, limits: SubmissionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Validate, persist and dispatch a new job.
    ///
    /// Validation failures and a duplicate id return before anything is
    /// written. Later failures come back as
    /// [`PipelineError::SubmissionFailed`] carrying the saga report.
    #[instrument(skip(self, request), fields(owner = %request.owner, job_id = tracing::field::Empty), err)]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, PipelineError> {
        let voice_ext = self.validate(&request)?;
        let job_id = JobId::derive(request.owner, request.submitted_at, &request.voice.filename);
        tracing::Span::current().record("job_id", tracing::field::display(job_id));

        let record = AudioProcessingRecord::pending(
            NewAudioProcessing {
                id: job_id,
                owner: request.owner,
                name: request.voice.filename.clone(),
                size: request.voice.size(),
                duration: request.voice.duration_secs.round() as i32,
                format: voice_ext.clone(),
                bitrate: request.voice.bitrate,
            },
            request.submitted_at,
        );

        let mut saga = SubmissionSaga::new(job_id, request.owner);

        self.records.insert(&record).await?;
        saga.complete(SubmissionStep::CreateRecord);

        match self.progress.set_stage(job_id, Stage::PENDING).await {
            Ok(()) => saga.complete(SubmissionStep::InitializeStage),
            Err(e) => saga.warn(SubmissionStep::InitializeStage, &e),
        }

        let payload = match self.upload_sources(job_id, &request, &voice_ext, &mut saga).await {
            Ok(payload) => payload,
            Err(e) => return Err(self.abort(saga, SubmissionStep::UploadArtifacts, e).await),
        };
        saga.complete(SubmissionStep::UploadArtifacts);

        let message = match self.publisher.publish(job_id, request.priority, payload).await {
            Ok(message) => message,
            Err(e) => return Err(self.abort(saga, SubmissionStep::Publish, e.into()).await),
        };
        saga.complete(SubmissionStep::Publish);

        match self.progress.invalidate_library(request.owner).await {
            Ok(()) => saga.complete(SubmissionStep::InvalidateListCache),
            Err(e) => saga.warn(SubmissionStep::InvalidateListCache, &e),
        }

        info!(priority = ?request.priority, "job submitted");
        Ok(SubmitOutcome {
            job_id,
            record,
            message,
            report: saga.into_report(),
        })
    }

    /// Fail-fast validation. Returns the voice file's extension.
    fn validate(&self, request: &SubmitRequest) -> Result<String, PipelineError> {
        self.limits.check(&request.voice, "voice file")?;
        if let Some(instrument) = &request.instrument {
            self.limits.check(instrument, "instrument file")?;
        }
        validate_reference_url(&request.reference_url)?;

        request
            .voice
            .extension()
            .ok_or_else(|| DomainError::validation("voice file has no file extension").into())
    }

    async fn upload_sources(
        &self,
        job_id: JobId,
        request: &SubmitRequest,
        voice_ext: &str,
        saga: &mut SubmissionSaga,
    ) -> Result<JobPayload, PipelineError> {
        let voice_file_url = self
            .upload(request.voice.bytes.clone(), &format!("{job_id}-voice.{voice_ext}"))
            .await?;
        saga.track_upload(voice_file_url.clone());

        let instrument_file_url = match &request.instrument {
            Some(file) => {
                let ext = file.extension().unwrap_or_else(|| voice_ext.to_string());
                let url = self
                    .upload(file.bytes.clone(), &format!("{job_id}-instrument.{ext}"))
                    .await?;
                saga.track_upload(url.clone());
                Some(url)
            }
            None => None,
        };

        let reference = self.references.fetch(&request.reference_url).await?;
        let reference_file_url = self
            .upload(reference, &format!("{job_id}-reference.mp3"))
            .await?;
        saga.track_upload(reference_file_url.clone());

        Ok(JobPayload {
            voice_file_url,
            instrument_file_url,
            reference_file_url,
            is_denoise: request.is_denoise,
            is_autotune: request.is_autotune,
        })
    }

    async fn abort(
        &self,
        mut saga: SubmissionSaga,
        step: SubmissionStep,
        source: PipelineError,
    ) -> PipelineError {
        warn!(?step, error = %source, "submission failed; compensating");
        saga.compensate(self.blobs.as_ref(), &self.progress).await;
        PipelineError::SubmissionFailed {
            step,
            report: saga.into_report(),
            source: Box::new(source),
        }
    }

    /// One job with its resolved stage.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn get(&self, id: JobId) -> Result<AudioProcessingView, PipelineError> {
        let record = match self.progress.cached_detail(id).await {
            Some(record) => record,
            None => {
                let record = self
                    .records
                    .get(id)
                    .await?
                    .ok_or(PipelineError::NotFound(id))?;
                if let Err(e) = self.progress.cache_detail(&record).await {
                    warn!(error = %e, "failed to cache record detail");
                }
                record
            }
        };

        Ok(self.view(record).await)
    }

    /// Page `page` (1-based) of the owner's jobs, newest first.
    #[instrument(skip(self), fields(owner = %owner), err)]
    pub async fn list_library(&self, owner: UserId, page: usize) -> Result<LibraryPage, PipelineError> {
        if page == 0 {
            return Err(DomainError::validation("page must be 1 or greater").into());
        }

        let records = match self.progress.cached_library(owner).await {
            Some(records) => records,
            None => {
                let records = self.records.list_by_owner(owner).await?;
                if let Err(e) = self.progress.cache_library(owner, &records).await {
                    warn!(error = %e, "failed to cache owner library");
                }
                records
            }
        };

        let total_data = records.len();
        let (start, end) = LibraryPage::slice_bounds(page, total_data);
        let mut items = Vec::with_capacity(end - start);
        for record in records.into_iter().skip(start).take(end - start) {
            items.push(self.view(record).await);
        }

        Ok(LibraryPage {
            items,
            page,
            limit: LIBRARY_PAGE_SIZE,
            total_data,
            total_page: LibraryPage::total_pages(total_data),
        })
    }

    /// Store the processor's three automatic results and mark the job
    /// complete.
    #[instrument(skip(self, files), fields(job_id = %id), err)]
    pub async fn update_result(
        &self,
        id: JobId,
        files: ResultFiles,
    ) -> Result<AudioProcessingView, PipelineError> {
        let record = self.require(id).await?;

        let urls = ResultUrls {
            standard: self.upload_result(&record, "standard", files.standard).await?,
            dynamic: self.upload_result(&record, "dynamic", files.dynamic).await?,
            smooth: self.upload_result(&record, "smooth", files.smooth).await?,
        };

        let record = self.records.save_results(id, &urls, Utc::now()).await?;
        // The record is already complete; stale responses must go even if
        // the stage write fails.
        let invalidated = self.progress.invalidate(id, record.owner).await;
        let staged = self.progress.set_stage(id, Stage::COMPLETE).await;
        invalidated?;
        staged?;

        info!("results stored; job complete");
        Ok(AudioProcessingView {
            record,
            stage: Some(Stage::COMPLETE),
        })
    }

    /// Record a processor milestone. Regressions are accepted and logged.
    #[instrument(skip(self), fields(job_id = %id, stage = %stage), err)]
    pub async fn update_stage(&self, id: JobId, stage: Stage) -> Result<(), PipelineError> {
        let record = self.require(id).await?;

        if let Some(previous) = self.progress.get_stage(id).await {
            if stage < previous {
                warn!(%previous, "stage regression accepted");
            }
        }
        if record.has_all_results() && !stage.is_complete() {
            warn!("stage update on a completed job; record still reads as complete");
        }

        self.progress.set_stage(id, stage).await?;
        Ok(())
    }

    /// Manual override: upload a hand-made result and attach it to the job.
    #[instrument(skip(self, file), fields(job_id = %id), err)]
    pub async fn set_manual_result(
        &self,
        id: JobId,
        file: UploadedFile,
    ) -> Result<AudioProcessingView, PipelineError> {
        let record = self.require(id).await?;
        let url = self.upload_result(&record, "manual", file).await?;

        let record = self.records.save_manual(id, &url, Utc::now()).await?;
        self.progress.invalidate(id, record.owner).await?;

        info!("manual result stored");
        Ok(self.view(record).await)
    }

    async fn require(&self, id: JobId) -> Result<AudioProcessingRecord, PipelineError> {
        self.records.get(id).await?.ok_or(PipelineError::NotFound(id))
    }

    async fn view(&self, record: AudioProcessingRecord) -> AudioProcessingView {
        let cached = if record.has_all_results() {
            None
        } else {
            self.progress.get_stage(record.id).await
        };
        AudioProcessingView::new(record, cached)
    }

    async fn upload_result(
        &self,
        record: &AudioProcessingRecord,
        kind: &str,
        file: UploadedFile,
    ) -> Result<String, PipelineError> {
        let ext = extension(&file.filename).unwrap_or_else(|| record.format.clone());
        self.upload(file.bytes, &format!("{}-{kind}.{ext}", record.id)).await
    }

    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<String, PipelineError> {
        Ok(self.blobs.upload(bytes, name, &self.bucket).await?)
    }
}

fn extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then(|| ext.to_ascii_lowercase())
}
