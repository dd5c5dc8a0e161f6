use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wallet_payments::domain::balance::{Balance, Reservation};
use wallet_payments::domain::event::OutboxMessage;
use wallet_payments::domain::payment::{Payment, PaymentStatus};
use wallet_payments::domain::ports::{
    BalanceLedger, InsertOutcome, OutboxReader, OutboxWriter, PaymentStore,
};
use wallet_payments::error::{PaymentError, Result};
use wallet_payments::infrastructure::in_memory::{
    InMemoryBalanceLedger, InMemoryPaymentStore, InMemoryScope,
};

mod common;
use common::{Harness, harness_with, request};

/// Reserves normally, then refuses to persist the payment.
struct BrokenPaymentStore {
    inner: InMemoryPaymentStore,
}

#[async_trait]
impl PaymentStore<InMemoryScope> for BrokenPaymentStore {
    async fn insert(&self, _scope: &mut InMemoryScope, _payment: &Payment) -> Result<InsertOutcome> {
        Err(PaymentError::PersistenceFailed("disk full".to_string()))
    }

    async fn get_for_update(&self, scope: &mut InMemoryScope, id: Uuid) -> Result<Option<Payment>> {
        self.inner.get_for_update(scope, id).await
    }

    async fn update_status(&self, scope: &mut InMemoryScope, id: Uuid, status: PaymentStatus) -> Result<()> {
        self.inner.update_status(scope, id, status).await
    }

    async fn find(&self, id: Uuid) -> Result<Option<Payment>> {
        self.inner.find(id).await
    }

    async fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<Payment>> {
        self.inner.find_by_idempotency_key(idempotency_key).await
    }
}

struct BrokenOutbox;

#[async_trait]
impl OutboxWriter<InMemoryScope> for BrokenOutbox {
    async fn enqueue(&self, _scope: &mut InMemoryScope, _message: &OutboxMessage) -> Result<()> {
        Err(PaymentError::PersistenceFailed("outbox unavailable".to_string()))
    }
}

/// Panics after the payment row was written.
struct PanickingOutbox;

#[async_trait]
impl OutboxWriter<InMemoryScope> for PanickingOutbox {
    async fn enqueue(&self, _scope: &mut InMemoryScope, _message: &OutboxMessage) -> Result<()> {
        panic!("outbox adapter bug");
    }
}

/// Reserves, then stalls past any sensible deadline.
struct StallingLedger {
    inner: InMemoryBalanceLedger,
    stall: Duration,
}

#[async_trait]
impl BalanceLedger<InMemoryScope> for StallingLedger {
    async fn get(&self, user_id: &str) -> Result<Balance> {
        self.inner.get(user_id).await
    }

    async fn reserve(&self, scope: &mut InMemoryScope, reservation: &Reservation) -> Result<()> {
        self.inner.reserve(scope, reservation).await?;
        tokio::time::sleep(self.stall).await;
        Ok(())
    }

    async fn release(&self, scope: &mut InMemoryScope, reservation_id: Uuid) -> Result<Reservation> {
        self.inner.release(scope, reservation_id).await
    }

    async fn confirm(&self, scope: &mut InMemoryScope, reservation_id: Uuid) -> Result<Reservation> {
        self.inner.confirm(scope, reservation_id).await
    }
}

async fn assert_untouched(h: &Harness, available: i64) {
    let balance = h.service.ports().ledger.get("u1").await.unwrap();
    assert_eq!((balance.available, balance.reserved), (available, 0));
    assert!(h.db.all_payments().await.is_empty());
    assert!(h.outbox.pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_persistence_failure_restores_balance() {
    let h = harness_with(&[("u1", 500)], |db, mut ports| {
        ports.payments = Arc::new(BrokenPaymentStore {
            inner: InMemoryPaymentStore::new(db.clone()),
        });
        ports
    })
    .await;

    let err = h.service.create(request("u1", "A", 200)).await.unwrap_err();
    assert!(matches!(err, PaymentError::PersistenceFailed(_)));
    assert!(err.is_infrastructure());
    assert_untouched(&h, 500).await;
    assert_eq!(h.metrics.snapshot().failed, 1);
}

#[tokio::test]
async fn test_outbox_failure_rolls_back_payment_and_reservation() {
    let h = harness_with(&[("u1", 500)], |_, mut ports| {
        ports.outbox = Arc::new(BrokenOutbox);
        ports
    })
    .await;

    let err = h.service.create(request("u1", "A", 200)).await.unwrap_err();
    assert!(matches!(err, PaymentError::PersistenceFailed(_)));
    assert_untouched(&h, 500).await;

    // The key was never committed, so it is still usable.
    let store = InMemoryPaymentStore::new(h.db.clone());
    assert!(store.find_by_idempotency_key("A").await.unwrap().is_none());
}

#[tokio::test]
async fn test_deadline_aborts_and_rolls_back() {
    let h = harness_with(&[("u1", 500)], |db, mut ports| {
        ports.ledger = Arc::new(StallingLedger {
            inner: InMemoryBalanceLedger::new(db.clone()),
            stall: Duration::from_secs(5),
        });
        ports
    })
    .await;
    let service = h.service.clone().with_request_timeout(Duration::from_millis(50));

    let err = service.create(request("u1", "A", 200)).await.unwrap_err();
    assert!(matches!(err, PaymentError::TransactionAborted(_)));
    assert_untouched(&h, 500).await;
}

#[tokio::test]
async fn test_failed_request_does_not_block_the_next() {
    let h = harness_with(&[("u1", 150)], |_, ports| ports).await;

    let err = h.service.create(request("u1", "big", 200)).await.unwrap_err();
    assert!(matches!(err, PaymentError::InsufficientFunds { requested: 200, .. }));

    let ok = h.service.create(request("u1", "small", 100)).await.unwrap();
    assert!(!ok.is_replay());
    let balance = h.service.ports().ledger.get("u1").await.unwrap();
    assert_eq!((balance.available, balance.reserved), (50, 100));
}

#[tokio::test]
async fn test_panic_inside_unit_of_work_rolls_back() {
    let h = harness_with(&[("u1", 500)], |_, mut ports| {
        ports.outbox = Arc::new(PanickingOutbox);
        ports
    })
    .await;

    let service = h.service.clone();
    let joined = tokio::spawn(async move { service.create(request("u1", "A", 200)).await }).await;
    assert!(joined.unwrap_err().is_panic());

    // The scope was dropped while unwinding, which undid the reservation and
    // the payment row and released the store for the next caller.
    assert_untouched(&h, 500).await;
}
