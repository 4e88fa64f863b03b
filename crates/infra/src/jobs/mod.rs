//! Job dispatch: publishing, the consumer retry loop and its bookkeeping.
//!
//! ## Components
//!
//! - `Publisher`: puts fresh jobs and retry successors on the topology
//! - `JobConsumer`: drives the processor and resolves each delivery
//! - `RetryPolicy`: the ceiling on `retry_count`

pub mod consumer;
pub mod publisher;
pub mod types;

pub use consumer::{ConsumerConfig, ConsumerError, ConsumerHandle, JobConsumer};
pub use publisher::{PublishError, Publisher};
pub use types::{ConsumerStats, DeliveryOutcome, RetryDecision, RetryPolicy};
