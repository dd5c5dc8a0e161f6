use thiserror::Error;
use uuid::Uuid;

/// How a failure should be treated by whoever sits at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller sent something unusable; retrying unchanged will not help.
    Client,
    /// An expected business outcome such as insufficient funds.
    Business,
    /// Store, broker or runtime fault; maps to a server-side failure.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("balance not found for user {0}")]
    BalanceNotFound(String),
    #[error("insufficient funds for user {user_id}: requested {requested}")]
    InsufficientFunds { user_id: String, requested: i64 },
    #[error("balance of user {user_id} would overflow")]
    BalanceOverflow { user_id: String },
    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),
    #[error("reservation {0} not found")]
    ReservationNotFound(Uuid),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    /// Raised inside a unit of work when the unique idempotency key constraint
    /// rejects an insert. The orchestrator turns it into a replay after rollback.
    #[error("payment with idempotency key {0} already exists")]
    DuplicateIdempotencyKey(String),
    #[error("failed to check idempotency: {0}")]
    IdempotencyCheckFailed(String),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PaymentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PaymentError::ValidationError(_)
            | PaymentError::Unauthorized(_)
            | PaymentError::CsvError(_) => ErrorClass::Client,
            PaymentError::BalanceNotFound(_)
            | PaymentError::InsufficientFunds { .. }
            | PaymentError::PaymentNotFound(_)
            | PaymentError::ReservationNotFound(_)
            | PaymentError::InvalidTransition { .. }
            | PaymentError::DuplicateIdempotencyKey(_) => ErrorClass::Business,
            PaymentError::BalanceOverflow { .. }
            | PaymentError::IdempotencyCheckFailed(_)
            | PaymentError::PersistenceFailed(_)
            | PaymentError::PublishFailed(_)
            | PaymentError::TransactionAborted(_)
            | PaymentError::Config(_)
            | PaymentError::IoError(_) => ErrorClass::Infrastructure,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    /// Short stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::ValidationError(_) => "validation",
            PaymentError::Unauthorized(_) => "unauthorized",
            PaymentError::BalanceNotFound(_) => "balance_not_found",
            PaymentError::InsufficientFunds { .. } => "insufficient_funds",
            PaymentError::BalanceOverflow { .. } => "balance_overflow",
            PaymentError::PaymentNotFound(_) => "payment_not_found",
            PaymentError::ReservationNotFound(_) => "reservation_not_found",
            PaymentError::InvalidTransition { .. } => "invalid_transition",
            PaymentError::DuplicateIdempotencyKey(_) => "duplicate",
            PaymentError::IdempotencyCheckFailed(_) => "idempotency_check",
            PaymentError::PersistenceFailed(_) => "persistence",
            PaymentError::PublishFailed(_) => "publish",
            PaymentError::TransactionAborted(_) => "transaction_aborted",
            PaymentError::Config(_) => "config",
            PaymentError::CsvError(_) => "csv",
            PaymentError::IoError(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_outcomes_are_not_infrastructure() {
        let err = PaymentError::InsufficientFunds {
            user_id: "u1".to_string(),
            requested: 10,
        };
        assert_eq!(err.class(), ErrorClass::Business);
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_validation_is_client_side() {
        let err = PaymentError::ValidationError("amount".to_string());
        assert_eq!(err.class(), ErrorClass::Client);
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_store_faults_are_infrastructure() {
        assert!(PaymentError::PersistenceFailed("down".into()).is_infrastructure());
        assert!(PaymentError::TransactionAborted("deadline".into()).is_infrastructure());
        assert!(PaymentError::PublishFailed("nack".into()).is_infrastructure());
        assert!(
            PaymentError::BalanceOverflow {
                user_id: "u1".into()
            }
            .is_infrastructure()
        );
    }
}
