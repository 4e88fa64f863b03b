//! HTTP processor client: `POST {base}/process`, reply `{"accepted": bool}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{ProcessRequest, Processor, ProcessorError};

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    accepted: bool,
}

#[derive(Debug, Clone)]
pub struct HttpProcessor {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpProcessor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProcessorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessorError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint(base_url),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint(base_url: &str) -> String {
    format!("{}/process", base_url.trim_end_matches('/'))
}

#[async_trait]
impl Processor for HttpProcessor {
    #[instrument(skip(self, request), fields(job_id = %request.job_id), err)]
    async fn process(&self, request: &ProcessRequest) -> Result<bool, ProcessorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProcessorError::Timeout(self.timeout)
                } else {
                    ProcessorError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: ProcessResponse = response
            .json()
            .await
            .map_err(|e| ProcessorError::InvalidResponse(e.to_string()))?;
        debug!(accepted = reply.accepted, "processor replied");
        Ok(reply.accepted)
    }
}
