//! Broker abstraction (mechanics only).
//!
//! A [`Broker`] owns one connection/channel. It declares the topology,
//! publishes to exchanges and opens consumers. Every [`Delivery`] must be
//! resolved exactly once through [`Delivery::ack`] or [`Delivery::nack`];
//! both consume the delivery so a message cannot be acknowledged twice.
//!
//! ## Delivery guarantees
//!
//! At-least-once. A delivery that is never resolved (crash, dropped channel)
//! is redelivered by the broker with `redelivered = true`, so handlers must
//! tolerate running twice for the same message.

use std::sync::Arc;

use async_trait::async_trait;

use crate::topology::Topology;

/// Broker-level message properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub priority: u8,
    /// Delivery mode 2: the broker persists before confirming.
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn persistent_json(priority: u8) -> Self {
        Self {
            priority,
            persistent: true,
            content_type: Some("application/json".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No connection or channel is established.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("topology declaration failed: {0}")]
    Declaration(String),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("consume failed: {0}")]
    Consume(String),
}

impl BrokerError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Resolves one delivery on the broker side.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement. Without `requeue` the queue's dead-letter
    /// exchange (if any) receives the message.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer and not yet resolved.
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: MessageProperties,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            properties,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. `None` once the channel is closed.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Stop receiving. Unresolved deliveries go back to their queue.
    async fn cancel(&mut self) -> Result<(), BrokerError>;
}

/// One broker connection/channel.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchanges, queues and bindings. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` with at most `prefetch` unresolved deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Close the channel and connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        (**self).declare(topology).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError> {
        (**self).publish(exchange, routing_key, message).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        (**self).consume(queue, consumer_tag, prefetch).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}
