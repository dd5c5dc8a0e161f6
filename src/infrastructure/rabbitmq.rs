//! RabbitMQ publisher used by the outbox relay.

use crate::config::BrokerConfig;
use crate::domain::event::OutboxMessage;
use crate::domain::ports::EventPublisher;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind, options::*,
    types::FieldTable,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Publishes outbox messages to a durable direct exchange with publisher confirms.
pub struct RabbitPublisher {
    connection: Arc<Connection>,
    channel: Arc<RwLock<Channel>>,
    config: BrokerConfig,
}

fn broker(context: &'static str) -> impl FnOnce(lapin::Error) -> PaymentError {
    move |e| PaymentError::PublishFailed(format!("{context}: {e}"))
}

impl RabbitPublisher {
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(broker("connect"))?;
        let channel = Self::open_channel(&connection, &config).await?;
        info!(exchange = %config.exchange, routing_key = %config.routing_key, "RabbitMQ publisher ready");
        Ok(Self {
            connection: Arc::new(connection),
            channel: Arc::new(RwLock::new(channel)),
            config,
        })
    }

    async fn open_channel(connection: &Connection, config: &BrokerConfig) -> Result<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(broker("create channel"))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker("enable confirms"))?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker("declare exchange"))?;
        Ok(channel)
    }

    /// Returns a live channel, reopening it if the broker closed the old one.
    async fn channel(&self) -> Result<Channel> {
        if !self.connection.status().connected() {
            return Err(PaymentError::PublishFailed(
                "RabbitMQ connection lost".to_string(),
            ));
        }

        let channel = self.channel.read().await;
        if channel.status().connected() {
            return Ok(channel.clone());
        }
        drop(channel);

        let fresh = Self::open_channel(&self.connection, &self.config).await?;
        *self.channel.write().await = fresh.clone();
        Ok(fresh)
    }
}

#[async_trait]
impl EventPublisher for RabbitPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        let body = message.body()?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(message.message_id.to_string().into())
            .with_timestamp(timestamp)
            .with_delivery_mode(2);

        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                &self.config.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(broker("publish"))?
            .await
            .map_err(broker("await confirm"))?;

        if confirm.is_nack() {
            return Err(PaymentError::PublishFailed(format!(
                "broker rejected message {}",
                message.message_id
            )));
        }
        debug!(message_id = %message.message_id, "message published");
        Ok(())
    }
}
