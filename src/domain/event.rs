use super::payment::Payment;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing key every payment creation is announced under.
pub const PAYMENT_INITIATED_ROUTING_KEY: &str = "payment.initiated";

/// Body of the message announcing a newly created payment.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PaymentInitiatedEvent {
    pub user_id: String,
    pub client_number: String,
    pub service_id: String,
    pub amount: i64,
    pub transaction_id: Uuid,
}

impl From<&Payment> for PaymentInitiatedEvent {
    fn from(payment: &Payment) -> Self {
        Self {
            user_id: payment.user_id.clone(),
            client_number: payment.client_number.clone(),
            service_id: payment.service_id.clone(),
            amount: payment.amount.value(),
            transaction_id: payment.id,
        }
    }
}

/// An event recorded in the same transaction as the state change it
/// describes, waiting for the relay to hand it to the broker.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct OutboxMessage {
    /// Insertion order, assigned by the store. Zero until stored.
    pub seq: i64,
    pub message_id: Uuid,
    pub user_id: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn payment_initiated(payment: &Payment) -> Result<Self> {
        let event = PaymentInitiatedEvent::from(payment);
        let payload = serde_json::to_value(&event)
            .map_err(|e| PaymentError::PersistenceFailed(format!("event encoding: {e}")))?;
        Ok(Self {
            seq: 0,
            message_id: Uuid::new_v4(),
            user_id: payment.user_id.clone(),
            routing_key: PAYMENT_INITIATED_ROUTING_KEY.to_string(),
            payload,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            delivered_at: None,
        })
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    /// Serialized body as it goes on the wire.
    pub fn body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.payload)
            .map_err(|e| PaymentError::PublishFailed(format!("event encoding: {e}")))
    }
}
