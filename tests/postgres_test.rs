//! Runs against a live PostgreSQL only when `DATABASE_URL` is set.
#![cfg(feature = "storage-postgres")]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use std::sync::Arc;
use uuid::Uuid;
use wallet_payments::application::payments::{CreateOutcome, PaymentPorts, PaymentService};
use wallet_payments::application::relay::{OutboxRelay, RelaySettings};
use wallet_payments::domain::balance::Balance;
use wallet_payments::domain::payment::{PaymentResolution, PaymentStatus};
use wallet_payments::domain::ports::{BalanceLedger, PaymentStore};
use wallet_payments::error::PaymentError;
use wallet_payments::infrastructure::in_memory::InMemoryPublisher;
use wallet_payments::infrastructure::metrics::InMemoryMetrics;
use wallet_payments::infrastructure::postgres::{
    PgBalanceLedger, PgDatabase, PgOutbox, PgPaymentStore,
};

mod common;
use common::request;

struct PgHarness {
    db: PgDatabase,
    outbox: PgOutbox,
    metrics: Arc<InMemoryMetrics>,
    service: PaymentService<PgDatabase>,
}

async fn pg_harness() -> Option<PgHarness> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let db = PgDatabase::connect(&url, 10).await.unwrap();
    db.migrate().await.unwrap();

    let store = Arc::new(PgPaymentStore::new(db.clone()));
    let outbox = PgOutbox::new(db.clone());
    let ports = PaymentPorts {
        ledger: Arc::new(PgBalanceLedger::new(db.clone())),
        guard: store.clone(),
        payments: store,
        outbox: Arc::new(outbox.clone()),
    };
    let metrics = Arc::new(InMemoryMetrics::new());
    let service = PaymentService::new(Arc::new(db.clone()), ports, metrics.clone());
    Some(PgHarness {
        db,
        outbox,
        metrics,
        service,
    })
}

/// Users and keys are shared across runs, so every test works on fresh ones.
fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn count(db: &PgDatabase, table: &str, user_id: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE user_id = $1"))
        .bind(user_id)
        .fetch_one(db.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pg_scenario_a_reserves_once() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let user = unique("u");
    let key = unique("A");
    h.db.seed_balance(&Balance::new(user.clone(), 1000, 0))
        .await
        .unwrap();

    let first = h.service.create(request(&user, &key, 100)).await.unwrap();
    let CreateOutcome::Created(payment) = first else {
        panic!("first call must create");
    };
    assert_eq!(payment.status, PaymentStatus::Pending);

    let again = h.service.create(request(&user, &key, 100)).await.unwrap();
    assert!(again.is_replay());

    let balance = h.service.ports().ledger.get(&user).await.unwrap();
    assert_eq!((balance.available, balance.reserved), (900, 100));
    assert_eq!(count(&h.db, "payments", &user).await, 1);
    assert_eq!(count(&h.db, "reservations", &user).await, 1);
    assert_eq!(count(&h.db, "outbox", &user).await, 1);
    assert_eq!(h.metrics.snapshot().idempotent, 1);
}

#[tokio::test]
async fn test_pg_scenario_b_insufficient_funds_leaves_nothing() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let user = unique("u");
    h.db.seed_balance(&Balance::new(user.clone(), 50, 0))
        .await
        .unwrap();

    let err = h
        .service
        .create(request(&user, &unique("B"), 100))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InsufficientFunds { .. }));

    let balance = h.service.ports().ledger.get(&user).await.unwrap();
    assert_eq!((balance.available, balance.reserved), (50, 0));
    assert_eq!(count(&h.db, "payments", &user).await, 0);
    assert_eq!(count(&h.db, "reservations", &user).await, 0);
    assert_eq!(count(&h.db, "outbox", &user).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pg_concurrent_duplicates_create_once() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let user = unique("u");
    let key = unique("same-key");
    h.db.seed_balance(&Balance::new(user.clone(), 1000, 0))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        let request = request(&user, &key, 100);
        handles.push(tokio::spawn(async move { service.create(request).await }));
    }

    let mut created = 0;
    let mut replayed = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            CreateOutcome::Created(_) => created += 1,
            CreateOutcome::Replayed { .. } => replayed += 1,
        }
    }
    assert_eq!((created, replayed), (1, 15));

    let balance = h.service.ports().ledger.get(&user).await.unwrap();
    assert_eq!((balance.available, balance.reserved), (900, 100));
    assert_eq!(count(&h.db, "payments", &user).await, 1);
    assert_eq!(count(&h.db, "reservations", &user).await, 1);
    assert_eq!(count(&h.db, "outbox", &user).await, 1);
}

#[tokio::test]
async fn test_pg_resolution_round_trip() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let user = unique("u");
    h.db.seed_balance(&Balance::new(user.clone(), 1000, 0))
        .await
        .unwrap();

    let CreateOutcome::Created(released) = h
        .service
        .create(request(&user, &unique("rel"), 100))
        .await
        .unwrap()
    else {
        panic!("expected a new payment");
    };
    let CreateOutcome::Created(confirmed) = h
        .service
        .create(request(&user, &unique("conf"), 250))
        .await
        .unwrap()
    else {
        panic!("expected a new payment");
    };

    let failed = h
        .service
        .resolve(released.id, PaymentResolution::Failed)
        .await
        .unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    let done = h
        .service
        .resolve(confirmed.id, PaymentResolution::Confirmed)
        .await
        .unwrap();
    assert_eq!(done.status, PaymentStatus::Confirmed);

    // 100 came back, 250 was consumed.
    let balance = h.service.ports().ledger.get(&user).await.unwrap();
    assert_eq!((balance.available, balance.reserved), (750, 0));

    // Repeating a resolution changes nothing, flipping it is rejected.
    h.service
        .resolve(released.id, PaymentResolution::Failed)
        .await
        .unwrap();
    let err = h
        .service
        .resolve(released.id, PaymentResolution::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidTransition { .. }));

    let balance = h.service.ports().ledger.get(&user).await.unwrap();
    assert_eq!((balance.available, balance.reserved), (750, 0));
    let stored = h
        .service
        .ports()
        .payments
        .find(released.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
}

#[tokio::test]
async fn test_pg_relay_delivers_committed_events() {
    let Some(h) = pg_harness().await else {
        return;
    };
    let user = unique("u");
    h.db.seed_balance(&Balance::new(user.clone(), 1000, 0))
        .await
        .unwrap();
    let CreateOutcome::Created(payment) = h
        .service
        .create(request(&user, &unique("ev"), 100))
        .await
        .unwrap()
    else {
        panic!("expected a new payment");
    };

    let publisher = InMemoryPublisher::new();
    let relay = OutboxRelay::new(
        Arc::new(h.outbox.clone()),
        Arc::new(publisher.clone()),
        h.metrics.clone(),
        RelaySettings::default(),
    );
    relay.drain().await.unwrap();

    // Other tests share the table, so only this user's rows are checked.
    let ours: Vec<_> = publisher
        .published()
        .await
        .into_iter()
        .filter(|m| m.user_id == user)
        .collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].payload["transaction_id"], payment.id.to_string());

    let undelivered: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox WHERE user_id = $1 AND delivered_at IS NULL",
    )
    .bind(&user)
    .fetch_one(h.db.pool())
    .await
    .unwrap();
    assert_eq!(undelivered, 0);
}

#[test]
fn test_pg_cli_replays_across_runs() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let user = unique("cli");
    let first_key = unique("k");

    let mut balances = tempfile::NamedTempFile::new().unwrap();
    writeln!(balances, "user_id,available,reserved").unwrap();
    writeln!(balances, "{user},1000,0").unwrap();
    balances.flush().unwrap();

    // 1. First run: seed the wallet and reserve 100
    let mut csv1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv1, "user_id,client_number,service_id,amount,idempotency_key").unwrap();
    writeln!(csv1, "{user},c-1,water,100,{first_key}").unwrap();
    csv1.flush().unwrap();

    let mut cmd1 = Command::new(cargo_bin!("wallet-payments"));
    cmd1.env_remove("AMQP_URL")
        .arg(csv1.path())
        .arg("--balances")
        .arg(balances.path())
        .arg("--database-url")
        .arg(&url);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains(&format!("{user},900,100")));

    // 2. Second run without seeding: the old key replays, a new one reserves
    let mut csv2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv2, "user_id,client_number,service_id,amount,idempotency_key").unwrap();
    writeln!(csv2, "{user},c-1,water,100,{first_key}").unwrap();
    writeln!(csv2, "{user},c-1,water,50,{}", unique("k")).unwrap();
    csv2.flush().unwrap();

    let mut cmd2 = Command::new(cargo_bin!("wallet-payments"));
    cmd2.env_remove("AMQP_URL")
        .arg(csv2.path())
        .arg("--database-url")
        .arg(&url);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);
    assert!(stdout2.contains(&format!("{user},850,150")));
}
