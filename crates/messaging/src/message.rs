//! Job message wire format (JSON body).

use serde::{Deserialize, Serialize};

use orpheon_core::{JobId, Priority};

use crate::broker::{MessageProperties, OutgoingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    #[default]
    Process,
    Retry,
}

/// Source artifacts and processing flags. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub voice_file_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_file_url: Option<String>,
    pub reference_file_url: String,
    #[serde(default)]
    pub is_denoise: bool,
    #[serde(default)]
    pub is_autotune: bool,
}

/// A job as it travels through the broker.
///
/// `action`, `priority` and `retry_count` default when absent so messages
/// from publishers that predate those fields still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    #[serde(default)]
    pub action: JobAction,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(flatten)]
    pub payload: JobPayload,
}

/// A body that can never be processed, whatever the number of retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("body is not valid job JSON: {0}")]
    InvalidJson(String),
    #[error("mandatory field is empty: {0}")]
    EmptyField(&'static str),
}

impl JobMessage {
    /// First-delivery message for a freshly submitted job.
    pub fn new(job_id: JobId, priority: Priority, payload: JobPayload) -> Self {
        Self {
            job_id,
            action: JobAction::Process,
            priority,
            retry_count: 0,
            payload,
        }
    }

    /// The message that replaces this one on the retry path.
    pub fn next_retry(&self) -> Self {
        Self {
            action: JobAction::Retry,
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, MalformedMessage> {
        let message: JobMessage = serde_json::from_slice(body)
            .map_err(|e| MalformedMessage::InvalidJson(e.to_string()))?;

        if message.payload.voice_file_url.trim().is_empty() {
            return Err(MalformedMessage::EmptyField("voice_file_url"));
        }
        if message.payload.reference_file_url.trim().is_empty() {
            return Err(MalformedMessage::EmptyField("reference_file_url"));
        }

        Ok(message)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Persistent JSON message carrying this job's priority.
    pub fn to_outgoing(&self) -> Result<OutgoingMessage, serde_json::Error> {
        Ok(OutgoingMessage {
            body: self.encode()?,
            properties: MessageProperties::persistent_json(self.priority.message_priority()),
        })
    }
}
