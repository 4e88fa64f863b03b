//! Job messaging: wire format, broker topology and broker backends.
//!
//! The broker abstraction is mechanics only. It knows nothing about retries
//! or processors; the consumer loop in `orpheon-infra` builds the retry state
//! machine on top of it.

pub mod broker;
pub mod in_memory;
pub mod message;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{Acker, Broker, BrokerError, Delivery, DeliveryStream, MessageProperties, OutgoingMessage};
pub use in_memory::InMemoryBroker;
pub use message::{JobAction, JobMessage, JobPayload, MalformedMessage};
pub use topology::{ExchangeKind, QueueArguments, Topology};

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
