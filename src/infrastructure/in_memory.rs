use crate::domain::balance::{Balance, Reservation, ReservationState, Transition};
use crate::domain::event::OutboxMessage;
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::{
    BalanceLedger, EventPublisher, IdempotencyGuard, InsertOutcome, OutboxReader, OutboxWriter,
    PaymentStore, UnitOfWork,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    balances: HashMap<String, Balance>,
    payments: HashMap<Uuid, Payment>,
    payment_keys: HashMap<String, Uuid>,
    reservations: HashMap<Uuid, Reservation>,
    outbox: BTreeMap<i64, OutboxMessage>,
    next_seq: i64,
}

/// Inverse of a single write, replayed newest-first on rollback.
enum Undo {
    Balance(String, Option<Balance>),
    Payment(Uuid, Option<Payment>),
    PaymentKey(String),
    Reservation(Uuid, Option<Reservation>),
    Outbox(i64),
}

/// A thread-safe in-memory database shared by all in-memory adapters.
///
/// Each scope holds the database lock from `begin` until commit or rollback,
/// so transactions are fully serialized. Writes go straight into the shared
/// state and are undone from a log if the scope does not commit.
#[derive(Default, Clone)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl InMemoryDatabase {
    /// Creates a new, empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions (or overwrites) a user's balance.
    pub async fn seed_balance(&self, balance: Balance) {
        let mut state = self.state.lock().await;
        state.balances.insert(balance.user_id.clone(), balance);
    }

    /// All balances, ordered by user id.
    pub async fn all_balances(&self) -> Vec<Balance> {
        let state = self.state.lock().await;
        let mut balances: Vec<Balance> = state.balances.values().cloned().collect();
        balances.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        balances
    }

    pub async fn all_payments(&self) -> Vec<Payment> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state.payments.values().cloned().collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    pub async fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.state.lock().await.reservations.get(&id).cloned()
    }

    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.state.lock().await.outbox.values().cloned().collect()
    }
}

/// Transaction scope over [`InMemoryDatabase`]. Rolls back on drop unless committed.
pub struct InMemoryScope {
    state: OwnedMutexGuard<State>,
    undo: Vec<Undo>,
    finished: bool,
}

impl InMemoryScope {
    fn put_balance(&mut self, balance: Balance) {
        let previous = self.state.balances.insert(balance.user_id.clone(), balance.clone());
        self.undo.push(Undo::Balance(balance.user_id, previous));
    }

    fn put_payment(&mut self, payment: Payment) {
        let id = payment.id;
        let previous = self.state.payments.insert(id, payment);
        self.undo.push(Undo::Payment(id, previous));
    }

    fn put_reservation(&mut self, reservation: Reservation) {
        let id = reservation.id;
        let previous = self.state.reservations.insert(id, reservation);
        self.undo.push(Undo::Reservation(id, previous));
    }

    fn undo_all(&mut self) {
        while let Some(entry) = self.undo.pop() {
            let state = &mut *self.state;
            match entry {
                Undo::Balance(user_id, Some(balance)) => {
                    state.balances.insert(user_id, balance);
                }
                Undo::Balance(user_id, None) => {
                    state.balances.remove(&user_id);
                }
                Undo::Payment(id, Some(payment)) => {
                    state.payments.insert(id, payment);
                }
                Undo::Payment(id, None) => {
                    state.payments.remove(&id);
                }
                Undo::PaymentKey(key) => {
                    state.payment_keys.remove(&key);
                }
                Undo::Reservation(id, Some(reservation)) => {
                    state.reservations.insert(id, reservation);
                }
                Undo::Reservation(id, None) => {
                    state.reservations.remove(&id);
                }
                Undo::Outbox(seq) => {
                    state.outbox.remove(&seq);
                }
            }
        }
    }

    fn transition_reservation(
        &mut self,
        id: Uuid,
        target: ReservationState,
    ) -> Result<Reservation> {
        let mut reservation = self
            .state
            .reservations
            .get(&id)
            .cloned()
            .ok_or(PaymentError::ReservationNotFound(id))?;
        if reservation.transition(target)? == Transition::AlreadyApplied {
            return Ok(reservation);
        }

        let mut balance = self
            .state
            .balances
            .get(&reservation.user_id)
            .cloned()
            .ok_or_else(|| PaymentError::BalanceNotFound(reservation.user_id.clone()))?;
        if target == ReservationState::Released {
            balance.release(reservation.amount)?;
        } else {
            balance.confirm(reservation.amount)?;
        }
        self.put_balance(balance);
        self.put_reservation(reservation.clone());
        Ok(reservation)
    }
}

impl Drop for InMemoryScope {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

#[async_trait]
impl UnitOfWork for InMemoryDatabase {
    type Scope = InMemoryScope;

    async fn begin(&self) -> Result<InMemoryScope> {
        let state = self.state.clone().lock_owned().await;
        Ok(InMemoryScope {
            state,
            undo: Vec::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut scope: InMemoryScope) -> Result<()> {
        scope.undo.clear();
        scope.finished = true;
        Ok(())
    }

    async fn rollback(&self, mut scope: InMemoryScope) -> Result<()> {
        scope.undo_all();
        scope.finished = true;
        Ok(())
    }
}

/// Balance ledger backed by [`InMemoryDatabase`].
#[derive(Clone)]
pub struct InMemoryBalanceLedger {
    db: InMemoryDatabase,
}

impl InMemoryBalanceLedger {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BalanceLedger<InMemoryScope> for InMemoryBalanceLedger {
    async fn get(&self, user_id: &str) -> Result<Balance> {
        let state = self.db.state.lock().await;
        state
            .balances
            .get(user_id)
            .cloned()
            .ok_or_else(|| PaymentError::BalanceNotFound(user_id.to_string()))
    }

    async fn reserve(&self, scope: &mut InMemoryScope, reservation: &Reservation) -> Result<()> {
        if scope.state.reservations.contains_key(&reservation.id) {
            return Err(PaymentError::PersistenceFailed(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        let mut balance = scope
            .state
            .balances
            .get(&reservation.user_id)
            .cloned()
            .ok_or_else(|| PaymentError::BalanceNotFound(reservation.user_id.clone()))?;
        balance.reserve(reservation.amount)?;
        scope.put_balance(balance);
        scope.put_reservation(reservation.clone());
        Ok(())
    }

    async fn release(&self, scope: &mut InMemoryScope, reservation_id: Uuid) -> Result<Reservation> {
        scope.transition_reservation(reservation_id, ReservationState::Released)
    }

    async fn confirm(&self, scope: &mut InMemoryScope, reservation_id: Uuid) -> Result<Reservation> {
        scope.transition_reservation(reservation_id, ReservationState::Confirmed)
    }
}

/// Payment store backed by [`InMemoryDatabase`], unique by idempotency key.
#[derive(Clone)]
pub struct InMemoryPaymentStore {
    db: InMemoryDatabase,
}

impl InMemoryPaymentStore {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdempotencyGuard<InMemoryScope> for InMemoryPaymentStore {
    async fn exists(&self, scope: &mut InMemoryScope, idempotency_key: &str) -> Result<bool> {
        Ok(scope.state.payment_keys.contains_key(idempotency_key))
    }
}

#[async_trait]
impl PaymentStore<InMemoryScope> for InMemoryPaymentStore {
    async fn insert(&self, scope: &mut InMemoryScope, payment: &Payment) -> Result<InsertOutcome> {
        if scope.state.payment_keys.contains_key(&payment.idempotency_key) {
            return Ok(InsertOutcome::Duplicate);
        }
        if scope.state.payments.contains_key(&payment.id) {
            return Err(PaymentError::PersistenceFailed(format!(
                "payment {} already exists",
                payment.id
            )));
        }
        scope
            .state
            .payment_keys
            .insert(payment.idempotency_key.clone(), payment.id);
        scope
            .undo
            .push(Undo::PaymentKey(payment.idempotency_key.clone()));
        scope.put_payment(payment.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_for_update(&self, scope: &mut InMemoryScope, id: Uuid) -> Result<Option<Payment>> {
        Ok(scope.state.payments.get(&id).cloned())
    }

    async fn update_status(
        &self,
        scope: &mut InMemoryScope,
        id: Uuid,
        status: PaymentStatus,
    ) -> Result<()> {
        let mut payment = scope
            .state
            .payments
            .get(&id)
            .cloned()
            .ok_or(PaymentError::PaymentNotFound(id))?;
        payment.status = status;
        payment.updated_at = Utc::now();
        scope.put_payment(payment);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Payment>> {
        Ok(self.db.state.lock().await.payments.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<Payment>> {
        let state = self.db.state.lock().await;
        Ok(state
            .payment_keys
            .get(idempotency_key)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }
}

/// Both sides of the outbox, backed by [`InMemoryDatabase`].
#[derive(Clone)]
pub struct InMemoryOutbox {
    db: InMemoryDatabase,
}

impl InMemoryOutbox {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OutboxWriter<InMemoryScope> for InMemoryOutbox {
    async fn enqueue(&self, scope: &mut InMemoryScope, message: &OutboxMessage) -> Result<()> {
        scope.state.next_seq += 1;
        let seq = scope.state.next_seq;
        let mut stored = message.clone();
        stored.seq = seq;
        scope.state.outbox.insert(seq, stored);
        scope.undo.push(Undo::Outbox(seq));
        Ok(())
    }
}

#[async_trait]
impl OutboxReader for InMemoryOutbox {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let state = self.db.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|m| !m.is_delivered())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, seq: i64) -> Result<()> {
        let mut state = self.db.state.lock().await;
        let message = state
            .outbox
            .get_mut(&seq)
            .ok_or_else(|| PaymentError::PersistenceFailed(format!("outbox row {seq} missing")))?;
        message.attempts += 1;
        message.last_error = None;
        message.delivered_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn mark_failed(&self, seq: i64, error: &str) -> Result<()> {
        let mut state = self.db.state.lock().await;
        let message = state
            .outbox
            .get_mut(&seq)
            .ok_or_else(|| PaymentError::PersistenceFailed(format!("outbox row {seq} missing")))?;
        message.attempts += 1;
        message.last_error = Some(error.to_string());
        Ok(())
    }
}

/// Publisher that keeps every delivered message in memory.
///
/// Stands in for the broker in tests and in the CLI when no broker is configured.
#[derive(Default, Clone)]
pub struct InMemoryPublisher {
    published: Arc<RwLock<Vec<OutboxMessage>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<OutboxMessage> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        self.published.write().await.push(message.clone());
        Ok(())
    }
}
