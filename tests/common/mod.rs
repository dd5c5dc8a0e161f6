#![allow(dead_code)]

use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use wallet_payments::application::payments::{PaymentPorts, PaymentService};
use wallet_payments::domain::balance::Balance;
use wallet_payments::domain::payment::CreatePaymentRequest;
use wallet_payments::infrastructure::in_memory::{
    InMemoryBalanceLedger, InMemoryDatabase, InMemoryOutbox, InMemoryPaymentStore, InMemoryScope,
};
use wallet_payments::infrastructure::metrics::InMemoryMetrics;

/// An in-memory service plus handles on everything it writes to.
pub struct Harness {
    pub db: InMemoryDatabase,
    pub outbox: InMemoryOutbox,
    pub metrics: Arc<InMemoryMetrics>,
    pub service: PaymentService<InMemoryDatabase>,
}

/// Default in-memory ports over `db`.
pub fn in_memory_ports(db: &InMemoryDatabase) -> PaymentPorts<InMemoryScope> {
    let store = Arc::new(InMemoryPaymentStore::new(db.clone()));
    PaymentPorts {
        ledger: Arc::new(InMemoryBalanceLedger::new(db.clone())),
        guard: store.clone(),
        payments: store,
        outbox: Arc::new(InMemoryOutbox::new(db.clone())),
    }
}

pub async fn harness_with(
    balances: &[(&str, i64)],
    customize: impl FnOnce(&InMemoryDatabase, PaymentPorts<InMemoryScope>) -> PaymentPorts<InMemoryScope>,
) -> Harness {
    let db = InMemoryDatabase::new();
    for (user, available) in balances {
        db.seed_balance(Balance::new(*user, *available, 0)).await;
    }
    let metrics = Arc::new(InMemoryMetrics::new());
    let ports = customize(&db, in_memory_ports(&db));
    let service = PaymentService::new(Arc::new(db.clone()), ports, metrics.clone());
    Harness {
        outbox: InMemoryOutbox::new(db.clone()),
        db,
        metrics,
        service,
    }
}

pub async fn harness(balances: &[(&str, i64)]) -> Harness {
    harness_with(balances, |_, ports| ports).await
}

pub fn request(user: &str, key: &str, amount: i64) -> CreatePaymentRequest {
    CreatePaymentRequest {
        user_id: user.to_string(),
        client_number: format!("client-{user}"),
        service_id: "electricity".to_string(),
        amount,
        idempotency_key: key.to_string(),
    }
}

/// Writes `rows` requests for user `u1`, each with its own key and amount 1.
pub fn generate_requests_csv(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["user_id", "client_number", "service_id", "amount", "idempotency_key"])?;
    for i in 1..=rows {
        wtr.write_record(["u1", "c-1", "water", "1", &format!("key-{i}")])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_balances_csv(path: &Path, balances: &[(&str, i64)]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["user_id", "available", "reserved"])?;
    for (user, available) in balances {
        wtr.write_record([*user, &available.to_string(), "0"])?;
    }

    wtr.flush()?;
    Ok(())
}
