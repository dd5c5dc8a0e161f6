use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};
use wallet_payments::application::payments::{CreateOutcome, PaymentPorts, PaymentService};
use wallet_payments::application::relay::OutboxRelay;
use wallet_payments::config::{AppConfig, BrokerConfig};
use wallet_payments::domain::balance::Balance;
use wallet_payments::domain::payment::CreatePaymentRequest;
use wallet_payments::domain::ports::{OutboxReaderRef, PublisherRef, UnitOfWork};
use wallet_payments::infrastructure::in_memory::{
    InMemoryBalanceLedger, InMemoryDatabase, InMemoryOutbox, InMemoryPaymentStore,
    InMemoryPublisher,
};
use wallet_payments::infrastructure::metrics::InMemoryMetrics;
use wallet_payments::interfaces::csv::balance_io::{BalanceReader, BalanceWriter};
use wallet_payments::interfaces::csv::request_reader::PaymentRequestReader;
use wallet_payments::telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input payment requests CSV file
    input: PathBuf,

    /// Wallet balances to provision before processing (user_id,available,reserved)
    #[arg(long)]
    balances: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL. If provided, uses PostgreSQL storage.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// AMQP URL. If provided, payment events are published to RabbitMQ.
    #[arg(long, env = "AMQP_URL")]
    amqp_url: Option<String>,

    /// Write published events to this file as JSON lines
    #[arg(long)]
    events: Option<PathBuf>,

    /// Maximum number of requests processed at once
    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,
}

/// Tally of one batch run.
#[derive(Debug, Default)]
struct BatchSummary {
    created: usize,
    replayed: usize,
    rejected: usize,
    delivered: usize,
    undelivered: usize,
}

impl BatchSummary {
    /// Counts one finished request and reports it on stderr if it failed.
    fn record(&mut self, joined: std::result::Result<(String, PaymentResult), JoinError>) {
        match joined {
            Ok((_, Ok(CreateOutcome::Created(_)))) => self.created += 1,
            Ok((_, Ok(CreateOutcome::Replayed { .. }))) => self.replayed += 1,
            Ok((key, Err(e))) => {
                self.rejected += 1;
                eprintln!("Error processing payment request {}: {}", key, e);
            }
            Err(e) => {
                self.rejected += 1;
                eprintln!("Error processing payment request: {}", e);
            }
        }
    }

    fn log(&self) {
        info!(
            created = self.created,
            replayed = self.replayed,
            rejected = self.rejected,
            delivered = self.delivered,
            undelivered = self.undelivered,
            "requests processed"
        );
    }
}

type PaymentResult = wallet_payments::error::Result<CreateOutcome>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path).into_diagnostic()?,
        None => AppConfig::default(),
    };
    if let Some(url) = cli.database_url.clone() {
        config.database_url = Some(url);
    }
    if let Some(url) = cli.amqp_url.clone() {
        config.broker = Some(match config.broker.take() {
            Some(broker) => BrokerConfig { url, ..broker },
            None => BrokerConfig::new(url),
        });
    }
    if let Some(concurrency) = cli.concurrency {
        config.service.concurrency = concurrency;
    }
    if let Some(level) = cli.log_level.clone() {
        config.log_level = level;
    }
    config.validate().into_diagnostic()?;
    telemetry::init_tracing(&config.log_level).into_diagnostic()?;

    let seeds = match &cli.balances {
        Some(path) => {
            let file = File::open(path).into_diagnostic()?;
            BalanceReader::new(file)
                .balances()
                .collect::<wallet_payments::error::Result<Vec<Balance>>>()
                .into_diagnostic()?
        }
        None => Vec::new(),
    };

    let file = File::open(&cli.input).into_diagnostic()?;
    let requests = PaymentRequestReader::new(file).requests();

    let (publisher, recorder) = connect_publisher(&config).await?;
    let metrics = Arc::new(InMemoryMetrics::new());

    let balances = match config.database_url.clone() {
        #[cfg(feature = "storage-postgres")]
        Some(url) => {
            use wallet_payments::infrastructure::postgres::{
                PgBalanceLedger, PgDatabase, PgOutbox, PgPaymentStore,
            };

            let db = PgDatabase::connect(&url, config.max_connections)
                .await
                .into_diagnostic()?;
            db.migrate().await.into_diagnostic()?;
            for balance in &seeds {
                db.seed_balance(balance).await.into_diagnostic()?;
            }
            let store = Arc::new(PgPaymentStore::new(db.clone()));
            let outbox = Arc::new(PgOutbox::new(db.clone()));
            let ports = PaymentPorts {
                ledger: Arc::new(PgBalanceLedger::new(db.clone())),
                guard: store.clone(),
                payments: store,
                outbox: outbox.clone(),
            };
            let service = PaymentService::new(Arc::new(db.clone()), ports, metrics.clone())
                .with_request_timeout(config.service.request_timeout());
            let summary = run_batch(service, outbox, publisher, &config, requests).await?;
            summary.log();
            db.all_balances().await.into_diagnostic()?
        }
        other => {
            if other.is_some() {
                eprintln!(
                    "WARNING: Persistent storage requested via --database-url, but 'storage-postgres' feature is not enabled. Falling back to In-Memory storage."
                );
            }

            let db = InMemoryDatabase::new();
            for balance in seeds {
                db.seed_balance(balance).await;
            }
            let store = Arc::new(InMemoryPaymentStore::new(db.clone()));
            let outbox = Arc::new(InMemoryOutbox::new(db.clone()));
            let ports = PaymentPorts {
                ledger: Arc::new(InMemoryBalanceLedger::new(db.clone())),
                guard: store.clone(),
                payments: store,
                outbox: outbox.clone(),
            };
            let service = PaymentService::new(Arc::new(db.clone()), ports, metrics.clone())
                .with_request_timeout(config.service.request_timeout());
            let summary = run_batch(service, outbox, publisher, &config, requests).await?;
            summary.log();
            db.all_balances().await
        }
    };

    let snapshot = metrics.snapshot();
    info!(
        started = snapshot.started,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        idempotent = snapshot.idempotent,
        outbox_delivered = snapshot.outbox_delivered,
        "batch finished"
    );

    if let Some(path) = &cli.events {
        match &recorder {
            Some(recorder) => write_events(path, recorder).await?,
            None => warn!("--events is ignored when publishing to a broker"),
        }
    }

    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_balances(balances).into_diagnostic()?;

    Ok(())
}

/// Picks the broker publisher, or an in-memory one that also serves `--events`.
async fn connect_publisher(config: &AppConfig) -> Result<(PublisherRef, Option<InMemoryPublisher>)> {
    match &config.broker {
        #[cfg(feature = "broker-rabbitmq")]
        Some(broker) => {
            use wallet_payments::infrastructure::rabbitmq::RabbitPublisher;

            let publisher = RabbitPublisher::connect(broker.clone())
                .await
                .into_diagnostic()?;
            Ok((Arc::new(publisher), None))
        }
        other => {
            if other.is_some() {
                eprintln!(
                    "WARNING: Event publishing requested via --amqp-url, but 'broker-rabbitmq' feature is not enabled. Falling back to In-Memory publisher."
                );
            }
            let recorder = InMemoryPublisher::new();
            Ok((Arc::new(recorder.clone()), Some(recorder)))
        }
    }
}

/// Creates each request as it is read, then drains the outbox once all of
/// them settled. At most `service.concurrency` requests are in flight.
async fn run_batch<U>(
    service: PaymentService<U>,
    outbox: OutboxReaderRef,
    publisher: PublisherRef,
    config: &AppConfig,
    requests: impl Iterator<Item = wallet_payments::error::Result<CreatePaymentRequest>>,
) -> Result<BatchSummary>
where
    U: UnitOfWork + 'static,
{
    let permits = Arc::new(Semaphore::new(config.service.concurrency));
    let mut tasks = JoinSet::new();
    let mut summary = BatchSummary::default();

    for request in requests {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                eprintln!("Error reading payment request: {}", e);
                continue;
            }
        };

        let permit = permits.clone().acquire_owned().await.into_diagnostic()?;
        while let Some(joined) = tasks.try_join_next() {
            summary.record(joined);
        }
        let service = service.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let key = request.idempotency_key.clone();
            (key, service.create(request).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        summary.record(joined);
    }

    let relay = OutboxRelay::new(
        outbox,
        publisher,
        service.metrics(),
        config.relay.settings(),
    );
    let report = relay.drain().await.into_diagnostic()?;
    summary.delivered = report.delivered;
    summary.undelivered = report.failed + report.deferred;
    Ok(summary)
}

async fn write_events(path: &Path, recorder: &InMemoryPublisher) -> Result<()> {
    let file = File::create(path).into_diagnostic()?;
    let mut out = BufWriter::new(file);
    for message in recorder.published().await {
        let line = serde_json::to_string(&message.payload).into_diagnostic()?;
        writeln!(out, "{}", line).into_diagnostic()?;
    }
    out.flush().into_diagnostic()?;
    Ok(())
}
