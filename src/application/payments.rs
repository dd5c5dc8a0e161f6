use crate::domain::balance::{Amount, Reservation};
use crate::domain::event::OutboxMessage;
use crate::domain::payment::{CreatePaymentRequest, Payment, PaymentResolution};
use crate::domain::ports::{
    BalanceLedger, IdempotencyGuard, InsertOutcome, MetricsRef, OutboxWriter, PaymentStore,
    UnitOfWork,
};
use crate::error::{PaymentError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Label used for metrics emitted by payment creation.
pub const PAYMENT_TRANSACTION_TYPE: &str = "Payment";

/// Default upper bound for one `create` call, store round-trips included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What a successful `create` did.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// Funds were reserved, the payment stored and its event queued.
    Created(Payment),
    /// The idempotency key was already used; nothing changed.
    Replayed { idempotency_key: String },
}

impl CreateOutcome {
    pub fn is_replay(&self) -> bool {
        matches!(self, CreateOutcome::Replayed { .. })
    }
}

/// The scoped ports one unit of work needs, all sharing the scope type `S`.
pub struct PaymentPorts<S: Send> {
    pub ledger: Arc<dyn BalanceLedger<S>>,
    pub guard: Arc<dyn IdempotencyGuard<S>>,
    pub payments: Arc<dyn PaymentStore<S>>,
    pub outbox: Arc<dyn OutboxWriter<S>>,
}

impl<S: Send> Clone for PaymentPorts<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            guard: Arc::clone(&self.guard),
            payments: Arc::clone(&self.payments),
            outbox: Arc::clone(&self.outbox),
        }
    }
}

/// Sequences idempotency check, reservation, persistence and outbox write
/// inside one unit of work.
///
/// Holds no locks of its own: concurrent calls are ordered entirely by the
/// store behind `U`.
pub struct PaymentService<U: UnitOfWork> {
    uow: Arc<U>,
    ports: PaymentPorts<U::Scope>,
    metrics: MetricsRef,
    request_timeout: Duration,
}

impl<U: UnitOfWork> Clone for PaymentService<U> {
    fn clone(&self) -> Self {
        Self {
            uow: Arc::clone(&self.uow),
            ports: self.ports.clone(),
            metrics: Arc::clone(&self.metrics),
            request_timeout: self.request_timeout,
        }
    }
}

impl<U: UnitOfWork + 'static> PaymentService<U> {
    /// Creates a new `PaymentService`.
    ///
    /// # Arguments
    ///
    /// * `uow` - Transaction scoping shared with every port.
    /// * `ports` - Ledger, idempotency guard, payment store and outbox writer.
    /// * `metrics` - Observability sink.
    pub fn new(uow: Arc<U>, ports: PaymentPorts<U::Scope>, metrics: MetricsRef) -> Self {
        Self {
            uow,
            ports,
            metrics,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn ports(&self) -> &PaymentPorts<U::Scope> {
        &self.ports
    }

    pub fn metrics(&self) -> MetricsRef {
        Arc::clone(&self.metrics)
    }

    /// Creates a payment exactly once per idempotency key.
    ///
    /// Calling this again with a key that already produced a payment returns
    /// [`CreateOutcome::Replayed`] and leaves every balance, row and event as it was.
    #[instrument(
        skip(self, request),
        fields(idempotency_key = %request.idempotency_key, user_id = %request.user_id)
    )]
    pub async fn create(&self, request: CreatePaymentRequest) -> Result<CreateOutcome> {
        let amount = request.validate()?;
        let started = Instant::now();
        self.metrics
            .record_transaction_started(PAYMENT_TRANSACTION_TYPE);

        let result =
            match tokio::time::timeout(self.request_timeout, self.create_in_scope(request, amount))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PaymentError::TransactionAborted(format!(
                    "request deadline of {:?} exceeded",
                    self.request_timeout
                ))),
            };

        self.metrics
            .record_processing_time(PAYMENT_TRANSACTION_TYPE, started.elapsed());
        match &result {
            Ok(CreateOutcome::Created(payment)) => {
                self.metrics
                    .record_transaction_completed(PAYMENT_TRANSACTION_TYPE, true);
                info!(payment_id = %payment.id, amount = %payment.amount, "payment created");
            }
            Ok(CreateOutcome::Replayed { .. }) => {
                self.metrics
                    .record_transaction_idempotent(PAYMENT_TRANSACTION_TYPE);
                debug!("idempotent replay");
            }
            Err(err) => {
                self.metrics
                    .record_transaction_completed(PAYMENT_TRANSACTION_TYPE, false);
                if err.is_infrastructure() {
                    error!(error = %err, kind = err.kind(), "failed to create payment");
                } else {
                    warn!(error = %err, kind = err.kind(), "payment rejected");
                }
            }
        }
        result
    }

    async fn create_in_scope(
        &self,
        request: CreatePaymentRequest,
        amount: Amount,
    ) -> Result<CreateOutcome> {
        let ports = self.ports.clone();
        let result = self
            .uow
            .run(move |scope| {
                Box::pin(async move {
                    let key = request.idempotency_key.clone();
                    let seen = ports
                        .guard
                        .exists(scope, &key)
                        .await
                        .map_err(|e| match e {
                            PaymentError::IdempotencyCheckFailed(_) => e,
                            other => PaymentError::IdempotencyCheckFailed(other.to_string()),
                        })?;
                    if seen {
                        return Ok(CreateOutcome::Replayed {
                            idempotency_key: key,
                        });
                    }

                    let payment = Payment::pending(&request, amount);
                    let reservation = Reservation::new(payment.id, &payment.user_id, amount);
                    ports.ledger.reserve(scope, &reservation).await?;

                    // The unique key constraint is the real duplicate check; a
                    // concurrent request may have committed since `exists`.
                    if ports.payments.insert(scope, &payment).await? == InsertOutcome::Duplicate {
                        return Err(PaymentError::DuplicateIdempotencyKey(key));
                    }

                    let message = OutboxMessage::payment_initiated(&payment)?;
                    ports.outbox.enqueue(scope, &message).await?;
                    Ok(CreateOutcome::Created(payment))
                })
            })
            .await;

        match result {
            Err(PaymentError::DuplicateIdempotencyKey(idempotency_key)) => {
                debug!("unique constraint rejected a concurrent duplicate");
                Ok(CreateOutcome::Replayed { idempotency_key })
            }
            other => other,
        }
    }

    /// Applies a settlement result to a pending payment and its reservation.
    ///
    /// Confirmed payments consume their reserved funds; failed and cancelled
    /// ones return them to available. Repeating the same resolution is a no-op.
    #[instrument(skip(self))]
    pub async fn resolve(&self, payment_id: Uuid, resolution: PaymentResolution) -> Result<Payment> {
        let ports = self.ports.clone();
        let resolved = self
            .uow
            .run(move |scope| {
                Box::pin(async move {
                    let mut payment = ports
                        .payments
                        .get_for_update(scope, payment_id)
                        .await?
                        .ok_or(PaymentError::PaymentNotFound(payment_id))?;

                    if !payment.transition(resolution.status())? {
                        return Ok(payment);
                    }

                    match resolution {
                        PaymentResolution::Confirmed => {
                            ports.ledger.confirm(scope, payment.id).await?;
                        }
                        PaymentResolution::Failed | PaymentResolution::Cancelled => {
                            ports.ledger.release(scope, payment.id).await?;
                        }
                    }
                    ports
                        .payments
                        .update_status(scope, payment.id, payment.status)
                        .await?;
                    Ok(payment)
                })
            })
            .await;

        match &resolved {
            Ok(payment) => info!(status = %payment.status, "payment resolved"),
            Err(err) => warn!(error = %err, kind = err.kind(), "payment resolution failed"),
        }
        resolved
    }
}
