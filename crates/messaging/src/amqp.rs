//! AMQP 0-9-1 broker backed by `lapin`.
//!
//! One connection, one channel in publisher-confirm mode. Publishing waits for
//! the broker's confirm so a returned `Ok` means the message is on disk
//! (persistent delivery mode).

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, instrument, warn};

use crate::broker::{
    Acker, Broker, BrokerError, Delivery, DeliveryStream, MessageProperties, OutgoingMessage,
};
use crate::topology::{ExchangeKind, QueueArguments, Topology};

const REPLY_SUCCESS: u16 = 200;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Open a connection and a confirm-mode channel.
    #[instrument(skip(uri), err)]
    pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        info!(channel_id = channel.id(), "amqp channel open");
        Ok(Self {
            connection,
            channel,
        })
    }

    fn error(&self, e: lapin::Error, wrap: fn(String) -> BrokerError) -> BrokerError {
        if self.channel.status().connected() {
            wrap(e.to_string())
        } else {
            BrokerError::Unavailable(e.to_string())
        }
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(dlx) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }
    if let Some(key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(key.as_str().into()),
        );
    }
    if let Some(ttl) = arguments.message_ttl {
        let millis = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
        table.insert("x-message-ttl".into(), AMQPValue::LongInt(millis));
    }
    table
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default().with_priority(properties.priority);
    if properties.persistent {
        props = props.with_delivery_mode(2);
    }
    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(content_type.as_str().into());
    }
    props
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        priority: (*props.priority()).unwrap_or(0),
        persistent: *props.delivery_mode() == Some(2),
        content_type: props.content_type().as_ref().map(|c| c.as_str().to_string()),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip(self, topology), err)]
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        for exchange in topology.exchanges() {
            self.channel
                .exchange_declare(
                    exchange.name,
                    exchange_kind(exchange.kind),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| self.error(e, BrokerError::Declaration))?;
        }

        for queue in topology.queues() {
            self.channel
                .queue_declare(
                    queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        ..Default::default()
                    },
                    queue_arguments(&queue.arguments),
                )
                .await
                .map_err(|e| self.error(e, BrokerError::Declaration))?;
        }

        for binding in topology.bindings() {
            self.channel
                .queue_bind(
                    binding.queue,
                    binding.exchange,
                    binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| self.error(e, BrokerError::Declaration))?;
        }

        debug!("topology declared");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|e| self.error(e, BrokerError::Publish))?
            .await
            .map_err(|e| self.error(e, BrokerError::Publish))?;

        if confirm.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker nacked message to {exchange}/{routing_key}"
            )));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| self.error(e, BrokerError::Consume))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.error(e, BrokerError::Consume))?;

        info!(queue, consumer_tag, prefetch, "consumer started");
        Ok(Box::new(AmqpDeliveryStream {
            channel: self.channel.clone(),
            consumer,
            consumer_tag: consumer_tag.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
                warn!(error = %e, "channel close failed");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        }
        info!("amqp connection closed");
        Ok(())
    }
}

struct AmqpDeliveryStream {
    channel: Channel,
    consumer: lapin::Consumer,
    consumer_tag: String,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let item = self.consumer.next().await?;
        Some(
            item.map(|d| {
                let properties = message_properties(&d.properties);
                Delivery::new(
                    d.data,
                    d.routing_key.as_str(),
                    d.redelivered,
                    properties,
                    Box::new(AmqpAcker(d.acker)),
                )
            })
            .map_err(|e| BrokerError::Consume(e.to_string())),
        )
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}
