//! In-process broker for tests/dev.
//!
//! Implements the subset of AMQP 0-9-1 semantics the dispatch topology relies
//! on: topic/direct routing, durable declarations (idempotent,
//! argument-checked), per-queue message TTL, dead-letter exchanges, manual
//! acknowledgements and per-consumer prefetch. Messages whose consumer is
//! cancelled (or whose connection drops) before resolving them go back to the
//! head of their queue flagged `redelivered`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{Acker, Broker, BrokerError, Delivery, DeliveryStream, OutgoingMessage};
use crate::topology::{topic_matches, ExchangeKind, QueueArguments, Topology};

/// Upper bound on how long an idle consumer sleeps before re-checking TTLs.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Cheaply cloneable handle; clones share one broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Debug)]
struct BrokerState {
    connected: bool,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<u64, ConsumerState>,
    next_delivery_tag: u64,
    next_consumer_id: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connected: true,
            exchanges: HashMap::new(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            consumers: HashMap::new(),
            next_delivery_tag: 0,
            next_consumer_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Debug, Clone)]
struct Queued {
    routing_key: String,
    message: OutgoingMessage,
    expires_at: Option<Instant>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    consumer: u64,
    entry: Queued,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    prefetch: usize,
    outstanding: usize,
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Ack,
    Nack { requeue: bool },
}

impl BrokerState {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker disconnected".to_string()))
        }
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        match self.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Declaration(format!(
                "exchange {name} already declared as {existing:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, name: &str, arguments: &QueueArguments) -> Result<(), BrokerError> {
        match self.queues.get(name) {
            Some(existing) if existing.arguments != *arguments => Err(BrokerError::Declaration(
                format!("queue {name} already declared with different arguments"),
            )),
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState {
                        arguments: arguments.clone(),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&mut self, binding: Binding) -> Result<(), BrokerError> {
        if !self.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::UnknownExchange(binding.exchange));
        }
        if !self.queues.contains_key(&binding.queue) {
            return Err(BrokerError::UnknownQueue(binding.queue));
        }
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    /// Route to every matching queue. Unroutable messages are dropped.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
        now: Instant,
    ) -> Result<usize, BrokerError> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for b in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Direct => b.routing_key == routing_key,
            };
            if matched && !targets.contains(&b.queue) {
                targets.push(b.queue.clone());
            }
        }

        if targets.is_empty() {
            debug!(exchange, routing_key, "unroutable message dropped");
        }

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                let expires_at = queue.arguments.message_ttl.map(|ttl| now + ttl);
                queue.ready.push_back(Queued {
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    expires_at,
                    redelivered: false,
                });
            }
        }

        Ok(targets.len())
    }

    fn dead_letter(&mut self, queue: &str, entry: Queued, now: Instant) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(dlx) = arguments.dead_letter_exchange else {
            debug!(queue, "no dead-letter exchange; message discarded");
            return;
        };
        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or(entry.routing_key);

        if let Err(e) = self.route(&dlx, &routing_key, entry.message, now) {
            warn!(queue, dead_letter_exchange = %dlx, error = %e, "dead-lettering failed; message discarded");
        }
    }

    /// Dead-letter every queue head whose TTL has elapsed.
    fn expire(&mut self, now: Instant) -> bool {
        let mut expired = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            while queue
                .ready
                .front()
                .is_some_and(|q| q.expires_at.is_some_and(|at| at <= now))
            {
                if let Some(entry) = queue.ready.pop_front() {
                    expired.push((name.clone(), entry));
                }
            }
        }

        let any = !expired.is_empty();
        for (queue, entry) in expired {
            self.dead_letter(&queue, entry, now);
        }
        any
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|q| q.ready.front().and_then(|e| e.expires_at))
            .min()
    }

    fn take(&mut self, consumer_id: u64) -> Option<(u64, Queued)> {
        let consumer = self.consumers.get_mut(&consumer_id)?;
        if consumer.outstanding >= consumer.prefetch {
            return None;
        }
        let queue = self.queues.get_mut(&consumer.queue)?;
        let entry = queue.ready.pop_front()?;

        self.next_delivery_tag += 1;
        let tag = self.next_delivery_tag;
        queue.unacked.insert(
            tag,
            Unacked {
                consumer: consumer_id,
                entry: entry.clone(),
            },
        );
        consumer.outstanding += 1;
        Some((tag, entry))
    }

    fn resolve(
        &mut self,
        queue: &str,
        tag: u64,
        resolution: Resolution,
        now: Instant,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let unacked = {
            let q = self
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            q.unacked
                .remove(&tag)
                .ok_or_else(|| BrokerError::Acknowledge(format!("unknown delivery tag {tag}")))?
        };

        if let Some(c) = self.consumers.get_mut(&unacked.consumer) {
            c.outstanding = c.outstanding.saturating_sub(1);
        }

        match resolution {
            Resolution::Ack => {}
            Resolution::Nack { requeue: true } => {
                let mut entry = unacked.entry;
                entry.redelivered = true;
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(entry);
                }
            }
            Resolution::Nack { requeue: false } => self.dead_letter(queue, unacked.entry, now),
        }
        Ok(())
    }

    /// Drop a consumer and return its unresolved deliveries to their queue.
    fn cancel_consumer(&mut self, consumer_id: u64) {
        if self.consumers.remove(&consumer_id).is_none() {
            return;
        }
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.consumer == consumer_id)
                .map(|(tag, _)| *tag)
                .collect();
            // Highest tag first so push_front restores original order.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(u) = queue.unacked.remove(&tag) {
                    let mut entry = u.entry;
                    entry.redelivered = true;
                    queue.ready.push_front(entry);
                }
            }
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self) {
        self.inner.notify.notify_waiters();
    }

    /// Simulate a lost connection: consumers end, unresolved deliveries are
    /// requeued, and every operation fails with `Unavailable` until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        {
            let mut state = self.state();
            state.connected = false;
            let ids: Vec<u64> = state.consumers.keys().copied().collect();
            for id in ids {
                state.cancel_consumer(id);
            }
        }
        self.wake();
    }

    pub fn reconnect(&self) {
        self.state().connected = true;
        self.wake();
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Messages ready for delivery in `queue` (after applying TTL expiry).
    pub fn queue_depth(&self, queue: &str) -> usize {
        let mut state = self.state();
        state.expire(Instant::now());
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out from `queue` and not yet resolved.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of ready message bodies in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.state();
        state.expire(Instant::now());
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|e| e.message.body.clone()).collect())
            .unwrap_or_default()
    }

    fn resolve(&self, queue: &str, tag: u64, resolution: Resolution) -> Result<(), BrokerError> {
        let result = self.state().resolve(queue, tag, resolution, Instant::now());
        self.wake();
        result
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.ensure_connected()?;

        for exchange in topology.exchanges() {
            state.declare_exchange(exchange.name, exchange.kind)?;
        }
        for queue in topology.queues() {
            state.declare_queue(queue.name, &queue.arguments)?;
        }
        for binding in topology.bindings() {
            state.bind(Binding {
                exchange: binding.exchange.to_string(),
                queue: binding.queue.to_string(),
                routing_key: binding.routing_key.to_string(),
            })?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            state.ensure_connected()?;
            let now = Instant::now();
            state.expire(now);
            state.route(exchange, routing_key, message, now)?;
        }
        self.wake();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let consumer_id = {
            let mut state = self.state();
            state.ensure_connected()?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
            state.next_consumer_id += 1;
            let id = state.next_consumer_id;
            state.consumers.insert(
                id,
                ConsumerState {
                    queue: queue.to_string(),
                    // AMQP: prefetch 0 means unlimited.
                    prefetch: if prefetch == 0 { usize::MAX } else { prefetch as usize },
                    outstanding: 0,
                },
            );
            id
        };

        Ok(Box::new(InMemoryDeliveryStream {
            broker: self.clone(),
            consumer_id,
            queue: queue.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.disconnect();
        Ok(())
    }
}

struct InMemoryDeliveryStream {
    broker: InMemoryBroker,
    consumer_id: u64,
    queue: String,
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.broker.state();
                if !state.connected || !state.consumers.contains_key(&self.consumer_id) {
                    return None;
                }

                let now = Instant::now();
                state.expire(now);

                if let Some((tag, entry)) = state.take(self.consumer_id) {
                    let acker = InMemoryAcker {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        tag,
                    };
                    return Some(Ok(Delivery::new(
                        entry.message.body,
                        entry.routing_key,
                        entry.redelivered,
                        entry.message.properties,
                        Box::new(acker),
                    )));
                }

                state
                    .next_expiry()
                    .map(|at| at.saturating_duration_since(now))
                    .unwrap_or(IDLE_POLL)
                    .min(IDLE_POLL)
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        self.broker.state().cancel_consumer(self.consumer_id);
        self.broker.wake();
        Ok(())
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.resolve(&self.queue, self.tag, Resolution::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.broker
            .resolve(&self.queue, self.tag, Resolution::Nack { requeue })
    }
}
