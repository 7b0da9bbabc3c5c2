//! RabbitMQ broker

use crate::{EventBroker, EventEnvelope, EventError};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind, options::*,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Publishes envelopes to a durable topic exchange.
///
/// Routing key is the event type, so consumers can bind to `tenant.*` or to
/// a single transition. Messages are persistent and confirmed by the broker.
///
/// The connection is opened on first publish and reopened after it drops,
/// so the control plane can start while the broker is still unreachable.
/// Failed publishes surface as errors and the outbox relay retries them.
pub struct RabbitMqBroker {
    url: String,
    exchange: String,
    session: Mutex<Option<Session>>,
}

impl RabbitMqBroker {
    /// Create a broker without touching the network.
    pub fn new(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            session: Mutex::new(None),
        }
    }

    /// Create a broker and open the connection eagerly.
    pub async fn connect(url: &str, exchange: &str) -> Result<Self, EventError> {
        let broker = Self::new(url, exchange);
        {
            let mut session = broker.session.lock().await;
            *session = Some(broker.open().await?);
        }
        Ok(broker)
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(Session::is_open)
    }

    async fn open(&self) -> Result<Session, EventError> {
        info!(exchange = %self.exchange, "Connecting to RabbitMQ");

        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(exchange = %self.exchange, "Connected to RabbitMQ");

        Ok(Session {
            connection,
            channel,
        })
    }

    fn properties(envelope: &EventEnvelope) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            "tenant_id".into(),
            AMQPValue::LongString(envelope.tenant_id.clone().into()),
        );
        headers.insert(
            "sequence".into(),
            AMQPValue::LongLongInt(envelope.sequence as i64),
        );

        BasicProperties::default()
            .with_message_id(envelope.dedup_key().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_headers(headers)
    }

    async fn publish_on(&self, channel: &Channel, envelope: &EventEnvelope) -> Result<(), EventError> {
        let payload = envelope.to_json()?;
        let routing_key = envelope.routing_key();

        debug!(
            exchange = %self.exchange,
            routing_key = routing_key,
            message_id = %envelope.dedup_key(),
            "Publishing message"
        );

        let confirm = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                Self::properties(envelope),
            )
            .await?;

        let confirmation = confirm.await.map_err(|e| {
            error!(error = %e, "Publisher confirm failed");
            EventError::Publish(format!("Publisher confirm failed: {}", e))
        })?;

        if confirmation.is_nack() {
            return Err(EventError::Rejected(envelope.dedup_key()));
        }

        Ok(())
    }
}

#[async_trait]
impl EventBroker for RabbitMqBroker {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        let mut session = self.session.lock().await;

        if !session.as_ref().is_some_and(Session::is_open) {
            if session.is_some() {
                warn!(exchange = %self.exchange, "RabbitMQ connection lost, reconnecting");
            }
            *session = Some(self.open().await?);
        }

        let result = match session.as_ref() {
            Some(open) => self.publish_on(&open.channel, envelope).await,
            None => Err(EventError::Publish("RabbitMQ session unavailable".into())),
        };

        if matches!(
            result,
            Err(EventError::Connection(_)) | Err(EventError::Publish(_))
        ) {
            *session = None;
        }

        result
    }

    fn name(&self) -> &'static str {
        "rabbitmq"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_does_not_connect() {
        let broker = RabbitMqBroker::new("amqp://127.0.0.1:1", "tenantry.events");
        assert!(!broker.is_connected().await);
        assert_eq!(broker.name(), "rabbitmq");
    }
}
