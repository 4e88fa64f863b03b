//! Places job messages on the dispatch topology.
//!
//! The publisher touches neither the progress cache nor the record store. A
//! returned error means the job was **not** dispatched.

use std::sync::Arc;

use tracing::{info, instrument};

use orpheon_core::{JobId, Priority};
use orpheon_messaging::topology::{EXCHANGE, ROUTING_NEW, ROUTING_RETRY};
use orpheon_messaging::{Broker, BrokerError, JobMessage, JobPayload};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to encode job message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PublishError::Broker(e) if e.is_unavailable())
    }
}

#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish a fresh job (`action=process`, `retry_count=0`) under `new`.
    #[instrument(skip(self, payload), fields(job_id = %job_id, routing_key = ROUTING_NEW), err)]
    pub async fn publish(
        &self,
        job_id: JobId,
        priority: Priority,
        payload: JobPayload,
    ) -> Result<JobMessage, PublishError> {
        let message = JobMessage::new(job_id, priority, payload);
        self.send(ROUTING_NEW, &message).await?;
        info!(?priority, "job published");
        Ok(message)
    }

    /// Publish the successor of `message` (`retry_count + 1`) under `retry`.
    #[instrument(
        skip(self, message),
        fields(job_id = %message.job_id, routing_key = ROUTING_RETRY, retry_count = message.retry_count),
        err
    )]
    pub async fn republish_for_retry(&self, message: &JobMessage) -> Result<JobMessage, PublishError> {
        let next = message.next_retry();
        self.send(ROUTING_RETRY, &next).await?;
        info!(next_retry_count = next.retry_count, "job scheduled for retry");
        Ok(next)
    }

    async fn send(&self, routing_key: &str, message: &JobMessage) -> Result<(), PublishError> {
        let outgoing = message.to_outgoing()?;
        self.broker.publish(EXCHANGE, routing_key, outgoing).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orpheon_messaging::topology::{MAIN_QUEUE, RETRY_QUEUE};
    use orpheon_messaging::{InMemoryBroker, Topology};

    fn payload() -> JobPayload {
        JobPayload {
            voice_file_url: "memory://b/v.wav".into(),
            instrument_file_url: None,
            reference_file_url: "memory://b/r.mp3".into(),
            is_denoise: false,
            is_autotune: true,
        }
    }

    async fn setup() -> (InMemoryBroker, Publisher) {
        let broker = InMemoryBroker::new();
        broker.declare(&Topology::default()).await.unwrap();
        (broker.clone(), Publisher::new(Arc::new(broker)))
    }

    #[tokio::test]
    async fn publish_lands_on_main_queue_with_zero_retries() {
        let (broker, publisher) = setup().await;
        let id = JobId::from_uuid(uuid::Uuid::from_u128(7));

        let sent = publisher.publish(id, Priority::High, payload()).await.unwrap();

        let bodies = broker.peek(MAIN_QUEUE);
        assert_eq!(bodies.len(), 1);
        let received = JobMessage::decode(&bodies[0]).unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_goes_to_retry_queue_with_incremented_count() {
        let (broker, publisher) = setup().await;
        let id = JobId::from_uuid(uuid::Uuid::from_u128(8));
        let first = JobMessage::new(id, Priority::Normal, payload());

        let next = publisher.republish_for_retry(&first).await.unwrap();

        assert_eq!(next.retry_count, 1);
        assert_eq!(broker.queue_depth(MAIN_QUEUE), 0);
        assert_eq!(broker.queue_depth(RETRY_QUEUE), 1);
    }

    #[tokio::test]
    async fn disconnected_broker_reports_unavailable() {
        let (broker, publisher) = setup().await;
        broker.disconnect();

        let err = publisher
            .publish(JobId::from_uuid(uuid::Uuid::nil()), Priority::Normal, payload())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
