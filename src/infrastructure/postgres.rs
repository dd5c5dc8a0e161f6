//! PostgreSQL adapters.
//!
//! Every scoped port runs its statements on the caller's
//! `sqlx::Transaction`. Dropping a transaction without committing rolls it
//! back when the connection returns to the pool.

use crate::domain::balance::{Amount, Balance, Reservation, ReservationState};
use crate::domain::event::OutboxMessage;
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::{
    BalanceLedger, IdempotencyGuard, InsertOutcome, OutboxReader, OutboxWriter, PaymentStore,
    UnitOfWork,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

pub type PgScope = Transaction<'static, Postgres>;

fn persistence(context: &'static str) -> impl FnOnce(sqlx::Error) -> PaymentError {
    move |e| PaymentError::PersistenceFailed(format!("{context}: {e}"))
}

/// Owns the connection pool. Built once at startup and cloned into every adapter.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| PaymentError::Config(format!("failed to connect to database: {e}")))?;
        info!(max_connections, "PostgreSQL pool initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PaymentError::PersistenceFailed(format!("migration failed: {e}")))
    }

    /// Provisions (or overwrites) a user's balance.
    pub async fn seed_balance(&self, balance: &Balance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance (user_id, available_balance, reserved_balance, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET available_balance = EXCLUDED.available_balance,
                reserved_balance = EXCLUDED.reserved_balance,
                updated_at = NOW()
            "#,
        )
        .bind(&balance.user_id)
        .bind(balance.available)
        .bind(balance.reserved)
        .execute(&self.pool)
        .await
        .map_err(persistence("seed balance"))?;
        Ok(())
    }

    pub async fn all_balances(&self) -> Result<Vec<Balance>> {
        let rows = sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, available_balance, reserved_balance, updated_at FROM balance ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(persistence("list balances"))?;
        Ok(rows.into_iter().map(Balance::from).collect())
    }
}

#[async_trait]
impl UnitOfWork for PgDatabase {
    type Scope = PgScope;

    async fn begin(&self) -> Result<PgScope> {
        self.pool
            .begin()
            .await
            .map_err(|e| PaymentError::TransactionAborted(format!("begin: {e}")))
    }

    async fn commit(&self, scope: PgScope) -> Result<()> {
        scope
            .commit()
            .await
            .map_err(|e| PaymentError::TransactionAborted(format!("commit: {e}")))
    }

    async fn rollback(&self, scope: PgScope) -> Result<()> {
        scope
            .rollback()
            .await
            .map_err(|e| PaymentError::TransactionAborted(format!("rollback: {e}")))
    }
}

#[derive(FromRow)]
struct BalanceRow {
    user_id: String,
    available_balance: i64,
    reserved_balance: i64,
    updated_at: DateTime<Utc>,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Self {
            user_id: row.user_id,
            available: row.available_balance,
            reserved: row.reserved_balance,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ReservationRow {
    id: Uuid,
    user_id: String,
    amount: i64,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = PaymentError;

    fn try_from(row: ReservationRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            amount: Amount::new(row.amount)?,
            state: ReservationState::parse(&row.state)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgBalanceLedger {
    db: PgDatabase,
}

impl PgBalanceLedger {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }

    async fn transition(
        &self,
        scope: &mut PgScope,
        id: Uuid,
        target: ReservationState,
    ) -> Result<Reservation> {
        let moved = sqlx::query_as::<_, ReservationRow>(
            r#"
            UPDATE reservations
            SET state = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'RESERVED'
            RETURNING id, user_id, amount, state, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(target.as_str())
        .fetch_optional(&mut **scope)
        .await
        .map_err(persistence("transition reservation"))?;

        let Some(row) = moved else {
            let current = sqlx::query_as::<_, ReservationRow>(
                "SELECT id, user_id, amount, state, created_at, updated_at FROM reservations WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&mut **scope)
            .await
            .map_err(persistence("load reservation"))?
            .ok_or(PaymentError::ReservationNotFound(id))?;
            let reservation = Reservation::try_from(current)?;
            if reservation.state == target {
                return Ok(reservation);
            }
            return Err(PaymentError::InvalidTransition {
                from: reservation.state.to_string(),
                to: target.to_string(),
            });
        };
        let reservation = Reservation::try_from(row)?;

        let statement = if target == ReservationState::Released {
            r#"
            UPDATE balance
            SET reserved_balance = reserved_balance - $1,
                available_balance = available_balance + $1,
                updated_at = NOW()
            WHERE user_id = $2 AND reserved_balance >= $1
            "#
        } else {
            r#"
            UPDATE balance
            SET reserved_balance = reserved_balance - $1,
                updated_at = NOW()
            WHERE user_id = $2 AND reserved_balance >= $1
            "#
        };
        let result = sqlx::query(statement)
            .bind(reservation.amount.value())
            .bind(&reservation.user_id)
            .execute(&mut **scope)
            .await
            .map_err(persistence("apply reservation transition"))?;
        if result.rows_affected() == 0 {
            return Err(PaymentError::PersistenceFailed(format!(
                "reserved balance of user {} is below {}",
                reservation.user_id, reservation.amount
            )));
        }
        Ok(reservation)
    }
}

#[async_trait]
impl BalanceLedger<PgScope> for PgBalanceLedger {
    async fn get(&self, user_id: &str) -> Result<Balance> {
        sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, available_balance, reserved_balance, updated_at FROM balance WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(persistence("get balance"))?
        .map(Balance::from)
        .ok_or_else(|| PaymentError::BalanceNotFound(user_id.to_string()))
    }

    async fn reserve(&self, scope: &mut PgScope, reservation: &Reservation) -> Result<()> {
        let amount = reservation.amount.value();
        // Single compare-and-update: the row lock makes concurrent reservations
        // for the same user wait and re-check the predicate.
        let result = sqlx::query(
            r#"
            UPDATE balance
            SET available_balance = available_balance - $1,
                reserved_balance = reserved_balance + $1,
                updated_at = NOW()
            WHERE user_id = $2 AND available_balance >= $1
            "#,
        )
        .bind(amount)
        .bind(&reservation.user_id)
        .execute(&mut **scope)
        .await
        .map_err(persistence("reserve funds"))?;

        if result.rows_affected() == 0 {
            let known: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM balance WHERE user_id = $1)")
                    .bind(&reservation.user_id)
                    .fetch_one(&mut **scope)
                    .await
                    .map_err(persistence("check balance"))?;
            return Err(if known {
                PaymentError::InsufficientFunds {
                    user_id: reservation.user_id.clone(),
                    requested: amount,
                }
            } else {
                PaymentError::BalanceNotFound(reservation.user_id.clone())
            });
        }

        sqlx::query(
            r#"
            INSERT INTO reservations (id, user_id, amount, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reservation.id)
        .bind(&reservation.user_id)
        .bind(amount)
        .bind(reservation.state.as_str())
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&mut **scope)
        .await
        .map_err(persistence("record reservation"))?;
        Ok(())
    }

    async fn release(&self, scope: &mut PgScope, reservation_id: Uuid) -> Result<Reservation> {
        self.transition(scope, reservation_id, ReservationState::Released)
            .await
    }

    async fn confirm(&self, scope: &mut PgScope, reservation_id: Uuid) -> Result<Reservation> {
        self.transition(scope, reservation_id, ReservationState::Confirmed)
            .await
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    idempotency_key: String,
    user_id: String,
    amount: i64,
    status: String,
    service_id: String,
    client_number: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = PaymentError;

    fn try_from(row: PaymentRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            idempotency_key: row.idempotency_key,
            user_id: row.user_id,
            amount: Amount::new(row.amount)?,
            status: PaymentStatus::parse(&row.status)?,
            service_id: row.service_id,
            client_number: row.client_number,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const PAYMENT_COLUMNS: &str =
    "id, idempotency_key, user_id, amount, status, service_id, client_number, created_at, updated_at";

#[derive(Clone)]
pub struct PgPaymentStore {
    db: PgDatabase,
}

impl PgPaymentStore {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdempotencyGuard<PgScope> for PgPaymentStore {
    async fn exists(&self, scope: &mut PgScope, idempotency_key: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM payments WHERE idempotency_key = $1)")
            .bind(idempotency_key)
            .fetch_one(&mut **scope)
            .await
            .map_err(|e| PaymentError::IdempotencyCheckFailed(e.to_string()))
    }
}

#[async_trait]
impl PaymentStore<PgScope> for PgPaymentStore {
    async fn insert(&self, scope: &mut PgScope, payment: &Payment) -> Result<InsertOutcome> {
        // ON CONFLICT keeps the transaction usable so the caller can roll back cleanly.
        let result = sqlx::query(
            r#"
            INSERT INTO payments (
                id, idempotency_key, user_id, amount, status,
                service_id, client_number, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(&payment.idempotency_key)
        .bind(&payment.user_id)
        .bind(payment.amount.value())
        .bind(payment.status.as_str())
        .bind(&payment.service_id)
        .bind(&payment.client_number)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut **scope)
        .await
        .map_err(persistence("create payment"))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn get_for_update(&self, scope: &mut PgScope, id: Uuid) -> Result<Option<Payment>> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .fetch_optional(&mut **scope)
            .await
            .map_err(persistence("load payment"))?
            .map(Payment::try_from)
            .transpose()
    }

    async fn update_status(&self, scope: &mut PgScope, id: Uuid, status: PaymentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut **scope)
            .await
            .map_err(persistence("update payment status"))?;
        if result.rows_affected() == 0 {
            return Err(PaymentError::PaymentNotFound(id));
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Payment>> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(persistence("find payment"))?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<Payment>> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = $1");
        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(idempotency_key)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(persistence("find payment"))?
            .map(Payment::try_from)
            .transpose()
    }
}

#[derive(FromRow)]
struct OutboxRow {
    seq: i64,
    message_id: Uuid,
    user_id: String,
    routing_key: String,
    payload: serde_json::Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        Self {
            seq: row.seq,
            message_id: row.message_id,
            user_id: row.user_id,
            routing_key: row.routing_key,
            payload: row.payload,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        }
    }
}

#[derive(Clone)]
pub struct PgOutbox {
    db: PgDatabase,
}

impl PgOutbox {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OutboxWriter<PgScope> for PgOutbox {
    async fn enqueue(&self, scope: &mut PgScope, message: &OutboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (message_id, user_id, routing_key, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.message_id)
        .bind(&message.user_id)
        .bind(&message.routing_key)
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(&mut **scope)
        .await
        .map_err(persistence("write outbox"))?;
        Ok(())
    }
}

#[async_trait]
impl OutboxReader for PgOutbox {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT seq, message_id, user_id, routing_key, payload, attempts, last_error, created_at, delivered_at
            FROM outbox
            WHERE delivered_at IS NULL
            ORDER BY seq
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await
        .map_err(persistence("read outbox"))?;
        Ok(rows.into_iter().map(OutboxMessage::from).collect())
    }

    async fn mark_delivered(&self, seq: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET delivered_at = COALESCE(delivered_at, NOW()), attempts = attempts + 1, last_error = NULL
            WHERE seq = $1
            "#,
        )
        .bind(seq)
        .execute(&self.db.pool)
        .await
        .map_err(persistence("mark outbox delivered"))?;
        Ok(())
    }

    async fn mark_failed(&self, seq: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = $2 WHERE seq = $1")
            .bind(seq)
            .bind(error)
            .execute(&self.db.pool)
            .await
            .map_err(persistence("mark outbox failed"))?;
        Ok(())
    }
}
