//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use super::consumer::DeliveryOutcome;
use super::{
    BrokerConnector, BrokerError, BrokerResult, BrokerSession, CloseSignal, DeliveryStream,
    InboundDelivery, LinkClosed, LinkOrigin, OutboundMessage, Topology,
};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Connects to an AMQP broker by URI.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerSession>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(BrokerError::Channel(e.to_string()));
            }
        };

        if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            let _ = connection.close(REPLY_SUCCESS, "confirm mode failed").await;
            return Err(BrokerError::Channel(e.to_string()));
        }

        let signal = CloseSignal::new();

        let conn_signal = signal.clone();
        connection.on_error(move |err| {
            log::warn!("[Broker] Connection error: {}", err);
            conn_signal.notify(LinkOrigin::Connection, Some(err.to_string()));
        });

        let channel_signal = signal.clone();
        channel.on_error(move |err| {
            log::warn!("[Broker] Channel error: {}", err);
            channel_signal.notify(LinkOrigin::Channel, Some(err.to_string()));
        });

        log::debug!("[Broker] AMQP connection and channel open");

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            signal,
        }))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    signal: CloseSignal,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_topology(&self, topology: &Topology) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("exchange {}: {}", topology.exchange, e)))?;

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("queue {}: {}", topology.queue, e)))?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("bind {}: {}", topology.queue, e)))?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_message_id(message.message_id.clone().into())
            .with_timestamp(message.timestamp)
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker rejected message {}",
                message.message_id
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let deliveries = consumer.map(|item| {
            item.map(|delivery| Box::new(AmqpDelivery(delivery)) as Box<dyn InboundDelivery>)
                .map_err(|e| BrokerError::Consume(e.to_string()))
        });
        Ok(deliveries.boxed())
    }

    fn is_open(&self) -> bool {
        !self.signal.is_closed()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) -> LinkClosed {
        self.signal.closed().await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.signal.notify(LinkOrigin::Connection, None);

        let mut errors = Vec::new();
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "closing").await {
                errors.push(format!("channel: {}", e));
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "closing").await {
                errors.push(format!("connection: {}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Close(errors))
        }
    }
}

struct AmqpDelivery(Delivery);

#[async_trait]
impl InboundDelivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.0.data
    }

    fn redelivered(&self) -> bool {
        self.0.redelivered
    }

    async fn settle(self: Box<Self>, outcome: DeliveryOutcome) -> BrokerResult<()> {
        let result = match outcome {
            DeliveryOutcome::Accept => self.0.ack(BasicAckOptions::default()).await,
            DeliveryOutcome::RejectRequeue | DeliveryOutcome::RejectDiscard => {
                self.0
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: outcome.requeue(),
                    })
                    .await
            }
        };
        result
            .map(|_| ())
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}
