//! Infrastructure layer: cache, record stores, dispatch, processor client,
//! blob storage, orchestration and configuration.

pub mod blob;
pub mod cache;
pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod records;

pub use blob::{BlobError, BlobStore, InMemoryBlobStore, ReferenceFetcher, StaticReferenceFetcher};
pub use cache::{CacheError, CacheStore, InMemoryCache};
pub use config::{ConfigError, PipelineConfig};
pub use jobs::{
    ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerStats, DeliveryOutcome, JobConsumer,
    PublishError, Publisher, RetryDecision, RetryPolicy,
};
pub use pipeline::{
    AudioProcessingView, LibraryPage, PipelineError, PipelineOrchestrator, ResultFiles,
    SagaReport, SubmissionStep, SubmitOutcome, SubmitRequest, UploadedFile,
};
pub use processor::{HttpProcessor, ProcessRequest, Processor, ProcessorError};
pub use progress::ProgressStore;
pub use records::{InMemoryRecordStore, JobRecordStore, PostgresRecordStore, RecordStoreError};

#[cfg(feature = "redis")]
pub use cache::RedisCache;
