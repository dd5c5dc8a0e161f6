use super::balance::Amount;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a payment.
///
/// ```text
/// PENDING ──► CONFIRMED
///    │
///    ├──────► FAILED
///    │
///    └──────► CANCELLED
/// ```
///
/// Creation only ever produces `Pending`; the other states are applied when
/// downstream settlement reports back.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PaymentError> {
        match value {
            "PENDING" => Ok(PaymentStatus::Pending),
            "CONFIRMED" => Ok(PaymentStatus::Confirmed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            other => Err(PaymentError::PersistenceFailed(format!(
                "unknown payment status {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub fn can_transition(&self, to: PaymentStatus) -> bool {
        matches!(self, PaymentStatus::Pending) && to.is_terminal()
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement outcome reported for a pending payment.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentResolution {
    Confirmed,
    Failed,
    Cancelled,
}

impl PaymentResolution {
    pub fn status(&self) -> PaymentStatus {
        match self {
            PaymentResolution::Confirmed => PaymentStatus::Confirmed,
            PaymentResolution::Failed => PaymentStatus::Failed,
            PaymentResolution::Cancelled => PaymentStatus::Cancelled,
        }
    }
}

/// Inbound request to debit a wallet.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct CreatePaymentRequest {
    pub user_id: String,
    pub client_number: String,
    pub service_id: String,
    pub amount: i64,
    pub idempotency_key: String,
}

impl CreatePaymentRequest {
    /// Rejects blank identifiers and non-positive amounts.
    pub fn validate(&self) -> Result<Amount, PaymentError> {
        let required = [
            ("idempotency_key", &self.idempotency_key),
            ("user_id", &self.user_id),
            ("service_id", &self.service_id),
            ("client_number", &self.client_number),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(PaymentError::ValidationError(format!(
                    "{field} is required"
                )));
            }
        }
        Amount::new(self.amount)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub idempotency_key: String,
    pub user_id: String,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub service_id: String,
    pub client_number: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Builds a fresh `Pending` payment with a newly generated id.
    pub fn pending(request: &CreatePaymentRequest, amount: Amount) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: request.idempotency_key.clone(),
            user_id: request.user_id.clone(),
            amount,
            status: PaymentStatus::Pending,
            service_id: request.service_id.clone(),
            client_number: request.client_number.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `Ok(false)` when the payment already holds `to`.
    pub fn transition(&mut self, to: PaymentStatus) -> Result<bool, PaymentError> {
        if self.status == to {
            return Ok(false);
        }
        if !self.status.can_transition(to) {
            return Err(PaymentError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(true)
    }
}
