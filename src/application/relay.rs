use crate::domain::ports::{MetricsRef, OutboxReaderRef, PublisherRef};
use crate::error::{PaymentError, Result};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Bound on a single broker call.
    pub publish_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            publish_timeout: Duration::from_secs(2),
        }
    }
}

/// Counts from one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
    /// Held back because an earlier message of the same user failed.
    pub deferred: usize,
}

/// Moves committed outbox rows to the broker, at least once each.
///
/// A message is marked delivered only after the publisher acknowledged it, so
/// a crash in between republishes it on the next pass. Consumers dedupe on
/// the message id.
pub struct OutboxRelay {
    outbox: OutboxReaderRef,
    publisher: PublisherRef,
    metrics: MetricsRef,
    settings: RelaySettings,
}

impl OutboxRelay {
    pub fn new(
        outbox: OutboxReaderRef,
        publisher: PublisherRef,
        metrics: MetricsRef,
        settings: RelaySettings,
    ) -> Self {
        Self {
            outbox,
            publisher,
            metrics,
            settings,
        }
    }

    /// Publishes one batch of pending messages in insertion order.
    ///
    /// Once a user's message fails, that user's later messages in the batch are
    /// left pending so they can never overtake it.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let pending = self.outbox.pending(self.settings.batch_size).await?;
        let mut report = RelayReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for message in pending {
            if blocked.contains(&message.user_id) {
                report.deferred += 1;
                continue;
            }

            let outcome =
                match tokio::time::timeout(self.settings.publish_timeout, self.publisher.publish(&message))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PaymentError::PublishFailed(format!(
                        "broker did not confirm within {:?}",
                        self.settings.publish_timeout
                    ))),
                };

            match outcome {
                Ok(()) => {
                    self.outbox.mark_delivered(message.seq).await?;
                    report.delivered += 1;
                    debug!(seq = message.seq, message_id = %message.message_id, "outbox message delivered");
                }
                Err(err) => {
                    warn!(seq = message.seq, error = %err, "outbox delivery failed");
                    self.outbox.mark_failed(message.seq, &err.to_string()).await?;
                    blocked.insert(message.user_id.clone());
                    report.failed += 1;
                }
            }
        }

        if report.delivered > 0 {
            self.metrics.record_outbox_delivered(report.delivered);
        }
        if report.failed > 0 {
            self.metrics.record_outbox_failed(report.failed);
        }
        Ok(report)
    }

    /// Repeats [`run_once`](Self::run_once) until nothing is left or a pass
    /// makes no progress. Returns the accumulated counts.
    pub async fn drain(&self) -> Result<RelayReport> {
        let mut total = RelayReport::default();
        loop {
            let report = self.run_once().await?;
            total.delivered += report.delivered;
            total.failed += report.failed;
            total.deferred += report.deferred;
            if report.delivered == 0 {
                return Ok(total);
            }
        }
    }

    /// Polls the outbox until `shutdown` flips to `true`, then drains once more.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            batch_size = self.settings.batch_size,
            "outbox relay started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run_once().await {
                        warn!(error = %err, "outbox relay pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let report = self.drain().await?;
        info!(
            delivered = report.delivered,
            failed = report.failed,
            "outbox relay stopped"
        );
        Ok(())
    }
}
