//! `orpheon-core`: domain foundation for the audio-processing pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, pipeline stages, the durable job record and submission
//! validation rules.

pub mod error;
pub mod id;
pub mod record;
pub mod stage;
pub mod validation;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId};
pub use record::{AudioProcessingRecord, NewAudioProcessing, ResultUrls};
pub use stage::{Priority, Stage};
pub use validation::{SourceFile, SubmissionLimits, validate_reference_url};
