//! Consumer loop: main queue → processor → ack / retry / dead-letter.
//!
//! One delivery at a time (prefetch 1). Per delivery:
//!
//! - body not a valid job → `nack(requeue=false)`, never reaches the processor
//! - processor accepted → `ack`
//! - processor failed and retries remain → publish successor under `retry`,
//!   then `ack` the original
//! - processor failed and out of retries → `nack(requeue=false)`
//! - the retry publish itself failed → `nack(requeue=true)` so the broker
//!   redelivers the original unchanged
//!
//! Shutdown stops taking new deliveries but lets the in-flight one finish its
//! processor call and resolution before the consumer is cancelled.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use orpheon_messaging::topology::{CONSUMER_PREFETCH, MAIN_QUEUE};
use orpheon_messaging::{Broker, BrokerError, Delivery, JobMessage};

use super::publisher::Publisher;
use super::types::{ConsumerStats, DeliveryOutcome, RetryDecision, RetryPolicy};
use crate::config::{PipelineConfig, DEFAULT_PROCESSOR_TIMEOUT};
use crate::processor::{ProcessRequest, Processor, ProcessorError};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer tag and log name.
    pub name: String,
    pub queue: String,
    pub prefetch: u16,
    pub processor_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "orpheon-worker".to_string(),
            queue: MAIN_QUEUE.to_string(),
            prefetch: CONSUMER_PREFETCH,
            processor_timeout: DEFAULT_PROCESSOR_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&PipelineConfig> for ConsumerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            name: config.worker_name.clone(),
            processor_timeout: config.processor_timeout,
            retry: config.retry,
            ..Self::default()
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.processor_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("delivery stream closed by the broker")]
    StreamClosed,

    #[error("consumer task failed: {0}")]
    Task(String),
}

/// Handle to a spawned consumer loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<Result<ConsumerStats, ConsumerError>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the in-flight delivery to drain.
    pub async fn shutdown(self) -> Result<ConsumerStats, ConsumerError> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the loop to end on its own (stream closed or token cancelled).
    pub async fn join(self) -> Result<ConsumerStats, ConsumerError> {
        self.join
            .await
            .map_err(|e| ConsumerError::Task(e.to_string()))?
    }
}

pub struct JobConsumer {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    processor: Arc<dyn Processor>,
    config: ConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl JobConsumer {
    /// Retry successors are published on the same broker the consumer reads.
    pub fn new(broker: Arc<dyn Broker>, processor: Arc<dyn Processor>, config: ConsumerConfig) -> Self {
        Self {
            publisher: Publisher::new(broker.clone()),
            broker,
            processor,
            config,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run the loop on a tokio task.
    pub fn spawn(self) -> ConsumerHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        ConsumerHandle {
            shutdown,
            join,
            stats,
        }
    }

    /// Consume until `shutdown` is cancelled or the broker ends the stream.
    ///
    /// A stream that ends without a shutdown request is an error so the
    /// supervisor restarts the worker.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ConsumerStats, ConsumerError> {
        let started = Instant::now();
        let mut stream = self
            .broker
            .consume(&self.config.queue, &self.config.name, self.config.prefetch)
            .await?;
        info!(
            consumer = %self.config.name,
            queue = %self.config.queue,
            max_retries = self.config.retry.max_retries,
            "consumer started"
        );

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = stream.next() => next,
            };

            match next {
                None if shutdown.is_cancelled() => break Ok(()),
                None => {
                    error!(consumer = %self.config.name, "delivery stream closed by broker");
                    break Err(ConsumerError::StreamClosed);
                }
                Some(Err(e)) => {
                    error!(consumer = %self.config.name, error = %e, "delivery stream failed");
                    break Err(e.into());
                }
                Some(Ok(delivery)) => {
                    if let Err(e) = self.handle(delivery).await {
                        warn!(consumer = %self.config.name, error = %e, "failed to resolve delivery");
                        if e.is_unavailable() {
                            break Err(e.into());
                        }
                    }
                }
            }

            self.update_stats(|s| s.uptime_secs = started.elapsed().as_secs());
        };

        if let Err(e) = stream.cancel().await {
            debug!(consumer = %self.config.name, error = %e, "consumer cancel failed");
        }

        self.update_stats(|s| s.uptime_secs = started.elapsed().as_secs());
        let stats = self.stats();
        info!(
            consumer = %self.config.name,
            received = stats.received,
            succeeded = stats.succeeded,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "consumer stopped"
        );
        result.map(|()| stats)
    }

    /// Process and resolve one delivery.
    ///
    /// Errors are broker failures while resolving; the delivery's fate is
    /// then up to the broker (redelivery once the channel drops).
    pub async fn handle(&self, delivery: Delivery) -> Result<DeliveryOutcome, BrokerError> {
        self.update_stats(|s| s.received += 1);

        let outcome = match JobMessage::decode(&delivery.body) {
            Ok(message) => self.dispatch(delivery, message).await?,
            Err(e) => {
                warn!(
                    consumer = %self.config.name,
                    error = %e,
                    redelivered = delivery.redelivered,
                    "malformed job message; dead-lettering"
                );
                delivery.nack(false).await?;
                self.update_stats(|s| s.malformed += 1);
                DeliveryOutcome::DeadLettered
            }
        };

        self.update_stats(|s| s.record(outcome));
        Ok(outcome)
    }

    #[instrument(
        skip(self, delivery, message),
        fields(
            consumer = %self.config.name,
            job_id = %message.job_id,
            retry_count = message.retry_count,
            redelivered = delivery.redelivered
        )
    )]
    async fn dispatch(
        &self,
        delivery: Delivery,
        message: JobMessage,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let failure = match self.call_processor(&message).await {
            Ok(()) => {
                delivery.ack().await?;
                info!("job handed to processor");
                return Ok(DeliveryOutcome::Acked);
            }
            Err(failure) => failure,
        };

        match self.config.retry.decide(message.retry_count) {
            RetryDecision::Retry => match self.publisher.republish_for_retry(&message).await {
                Ok(next) => {
                    delivery.ack().await?;
                    warn!(
                        error = %failure,
                        next_retry_count = next.retry_count,
                        "processing failed; retry scheduled"
                    );
                    Ok(DeliveryOutcome::Retried {
                        retry_count: next.retry_count,
                    })
                }
                Err(e) => {
                    error!(
                        error = %failure,
                        publish_error = %e,
                        "processing failed and retry publish failed; requeueing original"
                    );
                    delivery.nack(true).await?;
                    Ok(DeliveryOutcome::Requeued)
                }
            },
            RetryDecision::DeadLetter => {
                delivery.nack(false).await?;
                error!(
                    error = %failure,
                    max_retries = self.config.retry.max_retries,
                    "processing failed; retries exhausted, dead-lettering"
                );
                Ok(DeliveryOutcome::DeadLettered)
            }
        }
    }

    async fn call_processor(&self, message: &JobMessage) -> Result<(), ProcessorError> {
        let request = ProcessRequest::from(message);
        let timeout = self.config.processor_timeout;

        match tokio::time::timeout(timeout, self.processor.process(&request)).await {
            Err(_) => Err(ProcessorError::Timeout(timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(false)) => Err(ProcessorError::Rejected),
            Ok(Ok(true)) => Ok(()),
        }
    }

    fn update_stats<F: FnOnce(&mut ConsumerStats)>(&self, apply: F) {
        apply(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orpheon_core::{JobId, Priority};
    use orpheon_messaging::topology::{EXCHANGE, FAILED_QUEUE, RETRY_QUEUE, ROUTING_NEW};
    use orpheon_messaging::{InMemoryBroker, JobPayload, OutgoingMessage, Topology};

    use crate::processor::{ScriptedOutcome, ScriptedProcessor};

    fn message(retry_count: u32) -> JobMessage {
        let mut msg = JobMessage::new(
            JobId::from_uuid(uuid::Uuid::from_u128(1)),
            Priority::Normal,
            JobPayload {
                voice_file_url: "memory://b/v.wav".into(),
                instrument_file_url: None,
                reference_file_url: "memory://b/r.mp3".into(),
                is_denoise: false,
                is_autotune: false,
            },
        );
        msg.retry_count = retry_count;
        msg
    }

    async fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare(&Topology::default()).await.unwrap();
        broker
    }

    async fn deliver(broker: &InMemoryBroker, body: Vec<u8>) -> Delivery {
        broker
            .publish(
                EXCHANGE,
                ROUTING_NEW,
                OutgoingMessage {
                    body,
                    properties: Default::default(),
                },
            )
            .await
            .unwrap();
        let mut stream = broker.consume(MAIN_QUEUE, "test", 1).await.unwrap();
        stream.next().await.unwrap().unwrap()
    }

    fn consumer(broker: &InMemoryBroker, processor: Arc<ScriptedProcessor>) -> JobConsumer {
        JobConsumer::new(
            Arc::new(broker.clone()),
            processor,
            ConsumerConfig::default().with_processor_timeout(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered_without_processor_call() {
        let broker = broker().await;
        let processor = Arc::new(ScriptedProcessor::accepting());
        let consumer = consumer(&broker, processor.clone());

        let outcome = consumer.handle(deliver(&broker, b"{oops".to_vec()).await).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(processor.call_count(), 0);
        assert_eq!(broker.queue_depth(FAILED_QUEUE), 1);
        assert_eq!(consumer.stats().malformed, 1);
    }

    #[tokio::test]
    async fn failure_with_retries_left_publishes_successor() {
        let broker = broker().await;
        let processor = Arc::new(ScriptedProcessor::new([ScriptedOutcome::Reject], ScriptedOutcome::Accept));
        let consumer = consumer(&broker, processor);

        let body = message(1).encode().unwrap();
        let outcome = consumer.handle(deliver(&broker, body).await).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Retried { retry_count: 2 });
        let retried = broker.peek(RETRY_QUEUE);
        assert_eq!(JobMessage::decode(&retried[0]).unwrap().retry_count, 2);
        assert_eq!(broker.unacked_count(MAIN_QUEUE), 0);
    }

    #[tokio::test]
    async fn failure_at_ceiling_dead_letters() {
        let broker = broker().await;
        let processor = Arc::new(ScriptedProcessor::new([], ScriptedOutcome::Unreachable));
        let consumer = consumer(&broker, processor);

        let body = message(3).encode().unwrap();
        let outcome = consumer.handle(deliver(&broker, body).await).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(broker.queue_depth(FAILED_QUEUE), 1);
        assert_eq!(broker.queue_depth(RETRY_QUEUE), 0);
    }

    #[tokio::test]
    async fn processor_timeout_counts_as_failure() {
        let broker = broker().await;
        let processor = Arc::new(ScriptedProcessor::new([ScriptedOutcome::Hang], ScriptedOutcome::Accept));
        let consumer = consumer(&broker, processor);

        let body = message(0).encode().unwrap();
        let outcome = consumer.handle(deliver(&broker, body).await).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Retried { retry_count: 1 });
    }

    #[tokio::test]
    async fn spawned_consumer_drains_and_stops_on_shutdown() {
        let broker = broker().await;
        let processor = Arc::new(ScriptedProcessor::accepting());
        let handle = consumer(&broker, processor.clone()).spawn();

        let publisher = Publisher::new(Arc::new(broker.clone()));
        publisher
            .publish(message(0).job_id, Priority::High, message(0).payload)
            .await
            .unwrap();

        for _ in 0..100 {
            if handle.stats().succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(processor.call_count(), 1);
        assert_eq!(broker.queue_depth(MAIN_QUEUE), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_delivery_to_resolve() {
        let broker = broker().await;
        let processor = Arc::new(ScriptedProcessor::new([ScriptedOutcome::Hang], ScriptedOutcome::Accept));
        let handle = JobConsumer::new(
            Arc::new(broker.clone()),
            processor.clone(),
            ConsumerConfig::default().with_processor_timeout(Duration::from_millis(300)),
        )
        .spawn();

        Publisher::new(Arc::new(broker.clone()))
            .publish(message(0).job_id, Priority::Normal, message(0).payload)
            .await
            .unwrap();
        for _ in 0..100 {
            if processor.call_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(processor.call_count(), 1);

        // Cancelled while the processor call hangs: the delivery still times
        // out and is resolved before the loop exits.
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(processor.call_count(), 1);
        assert_eq!(broker.queue_depth(MAIN_QUEUE), 0);
        assert_eq!(broker.unacked_count(MAIN_QUEUE), 0);
        assert_eq!(broker.queue_depth(RETRY_QUEUE), 1);
    }

    #[tokio::test]
    async fn broker_closing_the_stream_is_an_error() {
        let broker = broker().await;
        let handle = consumer(&broker, Arc::new(ScriptedProcessor::accepting())).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.disconnect();

        assert!(matches!(handle.join().await, Err(ConsumerError::StreamClosed)));
    }
}
