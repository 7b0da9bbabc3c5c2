//! Outbox relay: delivers logged events to the broker.

use crate::{Backoff, EventBroker, EventEnvelope, EventError, Outbox};
use chrono::{TimeDelta, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Records fetched per pass
    pub batch_size: usize,
    /// Idle wait between passes when nobody signals new events
    pub poll_interval: Duration,
    /// Redelivery schedule, indexed by failed attempts so far
    pub backoff: Backoff,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            backoff: Backoff::exponential_with_jitter(Duration::from_millis(500))
                .with_max(Duration::from_secs(60)),
        }
    }
}

/// Counts for one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub delivered: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// Event Publisher.
///
/// State transitions never wait on this component: they only append to the
/// outbox. The relay then delivers at least once, in sequence order per
/// tenant, retrying failed records with backoff.
pub struct EventPublisher {
    outbox: Arc<dyn Outbox>,
    broker: Arc<dyn EventBroker>,
    config: PublisherConfig,
    wake: Arc<Notify>,
}

impl EventPublisher {
    pub fn new(outbox: Arc<dyn Outbox>, broker: Arc<dyn EventBroker>, config: PublisherConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle to nudge the relay after new events were appended.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Deliver a single envelope to the broker.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        debug!(
            broker = self.broker.name(),
            tenant_id = %envelope.tenant_id,
            event_type = %envelope.event_type,
            sequence = envelope.sequence,
            "Publishing event"
        );
        self.broker.publish(envelope).await
    }

    /// One pass over the due records.
    pub async fn relay_once(&self) -> Result<RelayStats, EventError> {
        let pending = self.outbox.pending(self.config.batch_size).await?;
        let mut stats = RelayStats::default();
        let mut stalled: HashSet<String> = HashSet::new();

        for record in pending {
            let envelope = &record.envelope;
            if stalled.contains(&envelope.tenant_id) {
                stats.deferred += 1;
                continue;
            }

            match self.publish(envelope).await {
                Ok(()) => {
                    self.outbox
                        .mark_delivered(&envelope.tenant_id, envelope.sequence)
                        .await?;
                    stats.delivered += 1;
                }
                Err(err) => {
                    let delay = self.config.backoff.delay_for_attempt(record.attempts);
                    let retry_at =
                        Utc::now() + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero());
                    warn!(
                        tenant_id = %envelope.tenant_id,
                        event_type = %envelope.event_type,
                        sequence = envelope.sequence,
                        attempts = record.attempts + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Event delivery failed"
                    );
                    self.outbox
                        .record_failure(
                            &envelope.tenant_id,
                            envelope.sequence,
                            &err.to_string(),
                            retry_at,
                        )
                        .await?;
                    stalled.insert(envelope.tenant_id.clone());
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Relay until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(broker = self.broker.name(), "Event relay started");
        loop {
            match self.relay_once().await {
                Ok(stats) if stats.delivered + stats.failed > 0 => {
                    debug!(
                        delivered = stats.delivered,
                        failed = stats.failed,
                        deferred = stats.deferred,
                        "Relay pass complete"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "Relay pass aborted"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Event relay stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
