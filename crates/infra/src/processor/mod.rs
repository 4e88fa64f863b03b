//! Downstream processing service.
//!
//! The processor is opaque: it accepts or refuses a job and later reports
//! progress/results back through the orchestrator. Unreachable, timed out and
//! `accepted = false` are all the same thing to the consumer: a failed
//! attempt.

pub mod http;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use orpheon_core::JobId;
use orpheon_messaging::JobMessage;

pub use http::HttpProcessor;
pub use scripted::{ScriptedOutcome, ScriptedProcessor};

/// Arguments of one processor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRequest {
    pub job_id: JobId,
    pub voice_file_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_file_url: Option<String>,
    pub reference_file_url: String,
    pub is_denoise: bool,
    pub is_autotune: bool,
}

impl From<&JobMessage> for ProcessRequest {
    fn from(message: &JobMessage) -> Self {
        Self {
            job_id: message.job_id,
            voice_file_url: message.payload.voice_file_url.clone(),
            instrument_file_url: message.payload.instrument_file_url.clone(),
            reference_file_url: message.payload.reference_file_url.clone(),
            is_denoise: message.payload.is_denoise,
            is_autotune: message.payload.is_autotune,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor unreachable: {0}")]
    Unreachable(String),

    #[error("processor timed out after {0:?}")]
    Timeout(Duration),

    #[error("processor refused the job")]
    Rejected,

    #[error("processor returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid processor response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// Hand a job to the processor. `Ok(false)` means it refused.
    async fn process(&self, request: &ProcessRequest) -> Result<bool, ProcessorError>;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, request: &ProcessRequest) -> Result<bool, ProcessorError> {
        (**self).process(request).await
    }
}
