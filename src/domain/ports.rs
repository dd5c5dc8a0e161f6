//! Capability ports of the payment core.
//!
//! Scoped ports take a `&mut S` transaction scope produced by a
//! [`UnitOfWork`]; everything they do through it commits or rolls back
//! together.

use super::balance::{Balance, Reservation};
use super::event::OutboxMessage;
use super::payment::{Payment, PaymentStatus};
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Future returned by the closure handed to [`UnitOfWork::run`].
pub type ScopeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transactional scoping across ledger, payment store and outbox.
///
/// A `Scope` must roll back when dropped without being committed. That is
/// what makes panics and cancelled futures safe: unwinding or dropping the
/// `run` future drops the scope before the caller sees anything.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Scope: Send + 'static;

    async fn begin(&self) -> Result<Self::Scope>;
    async fn commit(&self, scope: Self::Scope) -> Result<()>;
    async fn rollback(&self, scope: Self::Scope) -> Result<()>;

    /// Runs `f` inside a fresh scope, committing on `Ok` and rolling back on `Err`.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Self::Scope) -> ScopeFuture<'a, T> + Send + 'static,
    {
        let mut scope = self.begin().await?;
        match f(&mut scope).await {
            Ok(value) => {
                self.commit(scope).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(scope).await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
pub trait BalanceLedger<S: Send>: Send + Sync {
    /// Reads the current balance outside of any scope.
    async fn get(&self, user_id: &str) -> Result<Balance>;

    /// Atomically moves `reservation.amount` from available to reserved,
    /// only if enough is available, and records the reservation.
    async fn reserve(&self, scope: &mut S, reservation: &Reservation) -> Result<()>;

    /// Gives a reservation back to available. Idempotent.
    async fn release(&self, scope: &mut S, reservation_id: Uuid) -> Result<Reservation>;

    /// Consumes a reservation. Idempotent.
    async fn confirm(&self, scope: &mut S, reservation_id: Uuid) -> Result<Reservation>;
}

#[async_trait]
pub trait IdempotencyGuard<S: Send>: Send + Sync {
    async fn exists(&self, scope: &mut S, idempotency_key: &str) -> Result<bool>;
}

/// Result of inserting a payment under the unique idempotency key constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait PaymentStore<S: Send>: Send + Sync {
    async fn insert(&self, scope: &mut S, payment: &Payment) -> Result<InsertOutcome>;

    /// Loads a payment and holds it against concurrent updates until the scope ends.
    async fn get_for_update(&self, scope: &mut S, id: Uuid) -> Result<Option<Payment>>;

    async fn update_status(&self, scope: &mut S, id: Uuid, status: PaymentStatus) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Payment>>;

    async fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<Payment>>;
}

/// Write side of the transactional outbox.
#[async_trait]
pub trait OutboxWriter<S: Send>: Send + Sync {
    async fn enqueue(&self, scope: &mut S, message: &OutboxMessage) -> Result<()>;
}

/// Relay side of the transactional outbox.
#[async_trait]
pub trait OutboxReader: Send + Sync {
    /// Undelivered messages in insertion order.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>>;
    async fn mark_delivered(&self, seq: i64) -> Result<()>;
    async fn mark_failed(&self, seq: i64, error: &str) -> Result<()>;
}

/// Broker-facing publisher used by the outbox relay.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: &OutboxMessage) -> Result<()>;
}

/// Observability sink. Implementations must be cheap and never fail.
pub trait Metrics: Send + Sync {
    fn record_transaction_started(&self, transaction_type: &str);
    fn record_transaction_completed(&self, transaction_type: &str, success: bool);
    fn record_transaction_idempotent(&self, transaction_type: &str);
    fn record_processing_time(&self, transaction_type: &str, duration: Duration);
    fn record_outbox_delivered(&self, count: usize);
    fn record_outbox_failed(&self, count: usize);
}

pub type PublisherRef = Arc<dyn EventPublisher>;
pub type OutboxReaderRef = Arc<dyn OutboxReader>;
pub type MetricsRef = Arc<dyn Metrics>;
