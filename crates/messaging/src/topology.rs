//! Exchange/queue graph shared by publishers and consumers.
//!
//! ```text
//!                 ┌──── new ────► audio.processing.jobs ──(nack/reject)──┐
//! audio.processing┤                                                      │
//!   (topic)       └─── retry ───► audio.processing.retry                 ▼
//!        ▲                         (ttl expiry, dlx)      audio.processing.dlx
//!        └───────────── new ────────────┘                      (direct)
//!                                                                  │ failed
//!                                                                  ▼
//!                                                     audio.processing.failed
//! ```
//!
//! Names and routing keys are protocol constants: publisher and consumer
//! deployments must agree on them.

use std::time::Duration;

pub const EXCHANGE: &str = "audio.processing";
pub const DEAD_LETTER_EXCHANGE: &str = "audio.processing.dlx";

pub const MAIN_QUEUE: &str = "audio.processing.jobs";
pub const RETRY_QUEUE: &str = "audio.processing.retry";
pub const FAILED_QUEUE: &str = "audio.processing.failed";

pub const ROUTING_NEW: &str = "new";
pub const ROUTING_RETRY: &str = "retry";
pub const ROUTING_FAILED: &str = "failed";

/// Time a retried message sits in the retry queue before re-entering the main queue.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Unacknowledged deliveries per consumer channel.
pub const CONSUMER_PREFETCH: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: &'static str,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// `x-*` queue arguments this topology relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: &'static str,
    pub durable: bool,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: &'static str,
    pub exchange: &'static str,
    pub routing_key: &'static str,
}

/// The dispatch topology. Only the retry delay is tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub retry_delay: Duration,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl Topology {
    pub fn with_retry_delay(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        vec![
            ExchangeSpec {
                name: EXCHANGE,
                kind: ExchangeKind::Topic,
                durable: true,
            },
            ExchangeSpec {
                name: DEAD_LETTER_EXCHANGE,
                kind: ExchangeKind::Direct,
                durable: true,
            },
        ]
    }

    pub fn queues(&self) -> Vec<QueueSpec> {
        vec![
            QueueSpec {
                name: MAIN_QUEUE,
                durable: true,
                arguments: QueueArguments {
                    dead_letter_exchange: Some(DEAD_LETTER_EXCHANGE.to_string()),
                    dead_letter_routing_key: Some(ROUTING_FAILED.to_string()),
                    message_ttl: None,
                },
            },
            QueueSpec {
                name: RETRY_QUEUE,
                durable: true,
                arguments: QueueArguments {
                    dead_letter_exchange: Some(EXCHANGE.to_string()),
                    dead_letter_routing_key: Some(ROUTING_NEW.to_string()),
                    message_ttl: Some(self.retry_delay),
                },
            },
            QueueSpec {
                name: FAILED_QUEUE,
                durable: true,
                arguments: QueueArguments::default(),
            },
        ]
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        vec![
            BindingSpec {
                queue: MAIN_QUEUE,
                exchange: EXCHANGE,
                routing_key: ROUTING_NEW,
            },
            BindingSpec {
                queue: RETRY_QUEUE,
                exchange: EXCHANGE,
                routing_key: ROUTING_RETRY,
            },
            BindingSpec {
                queue: FAILED_QUEUE,
                exchange: DEAD_LETTER_EXCHANGE,
                routing_key: ROUTING_FAILED,
            },
        ]
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((k, key_rest)) if *word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
