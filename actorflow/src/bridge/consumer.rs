//! The queue consumer: decode, route, invoke, settle.

use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::message::{Delivery, TaskMessage};
use super::queue::Queue;
use crate::cancellation::CancellationToken;
use crate::config::BridgeConfig;
use crate::errors::{ActorflowError, Result};
use crate::gateway::Gateway;
use crate::observability::bridge_span;
use crate::retry::{RetryDecision, RetryPolicy};

/// How a delivery was settled.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Handled and removed from the queue.
    Acked,
    /// Failed and scheduled for redelivery.
    Retried {
        /// Redelivery delay.
        delay: Duration,
        /// The failure.
        error: ActorflowError,
    },
    /// Moved to the dead-letter sink and removed from the queue.
    DeadLettered {
        /// The last failure.
        error: ActorflowError,
    },
    /// The queue rejected the settlement; the message stays with the queue.
    Unsettled {
        /// The queue error.
        error: ActorflowError,
    },
}

impl Disposition {
    /// Short name for logs and reports.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Retried { .. } => "retried",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Unsettled { .. } => "unsettled",
        }
    }

    /// The error behind a non-ack disposition.
    #[must_use]
    pub fn error(&self) -> Option<&ActorflowError> {
        match self {
            Self::Acked => None,
            Self::Retried { error, .. }
            | Self::DeadLettered { error }
            | Self::Unsettled { error } => Some(error),
        }
    }
}

/// Per-message dispositions of one batch, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// `(message_id, disposition)` pairs.
    pub outcomes: Vec<(String, Disposition)>,
}

impl BatchReport {
    /// Number of messages in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns true if the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// The disposition of one message.
    #[must_use]
    pub fn disposition(&self, message_id: &str) -> Option<&Disposition> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == message_id)
            .map(|(_, d)| d)
    }

    fn count(&self, name: &str) -> usize {
        self.outcomes.iter().filter(|(_, d)| d.name() == name).count()
    }

    /// Messages acknowledged.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.count("acked")
    }

    /// Messages scheduled for redelivery.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.count("retried")
    }

    /// Messages dead-lettered.
    #[must_use]
    pub fn dead_lettered(&self) -> usize {
        self.count("dead_lettered")
    }

    /// Messages the queue failed to settle.
    #[must_use]
    pub fn unsettled(&self) -> usize {
        self.count("unsettled")
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "total": self.len(),
            "acked": self.acked(),
            "retried": self.retried(),
            "dead_lettered": self.dead_lettered(),
            "unsettled": self.unsettled(),
        })
    }
}

struct Attempt {
    delivery: Delivery,
    task: Option<TaskMessage>,
    outcome: Result<serde_json::Value>,
}

/// Feeds queue deliveries into units.
///
/// The bridge is the only place that decides between redelivery and the
/// dead-letter sink. Messages in a batch are independent: each is settled
/// on its own unless `ack_all` is on and the whole batch succeeded.
pub struct QueueBridge {
    gateway: Gateway,
    queue: Arc<dyn Queue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    batch_size: usize,
    max_concurrency: usize,
    ack_all: bool,
    poll_interval: Duration,
}

impl QueueBridge {
    /// Creates a bridge with the default [`BridgeConfig`].
    #[must_use]
    pub fn new(
        gateway: Gateway,
        queue: Arc<dyn Queue>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let config = BridgeConfig::default();
        Self {
            gateway,
            queue,
            dead_letters,
            policy: config.retry_policy(),
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency,
            ack_all: config.ack_all,
            poll_interval: config.poll_interval(),
        }
    }

    /// Applies batch, concurrency, retry and polling settings.
    #[must_use]
    pub fn with_config(mut self, config: &BridgeConfig) -> Self {
        self.policy = config.retry_policy();
        self.batch_size = config.batch_size.max(1);
        self.max_concurrency = config.max_concurrency.max(1);
        self.ack_all = config.ack_all;
        self.poll_interval = config.poll_interval();
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Receives one batch and settles every message in it.
    ///
    /// # Errors
    ///
    /// Returns the queue's error if receiving fails. Per-message failures are
    /// reported in the [`BatchReport`], never as an error.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let deliveries = self.queue.receive(self.batch_size).await?;
        Ok(self.process_deliveries(deliveries).await)
    }

    /// Processes already-received deliveries.
    pub async fn process_deliveries(&self, deliveries: Vec<Delivery>) -> BatchReport {
        if deliveries.is_empty() {
            return BatchReport::default();
        }
        debug!(count = deliveries.len(), "processing batch");

        if !self.ack_all {
            let mut settled: Vec<(usize, (String, Disposition))> = stream::iter(deliveries)
                .enumerate()
                .map(|(index, delivery)| {
                    let span = bridge_span(&delivery.message_id, delivery.attempt);
                    async move {
                        let id = delivery.message_id.clone();
                        let attempt = self.dispatch(delivery).await;
                        (index, (id, self.settle(attempt).await))
                    }
                    .instrument(span)
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;
            settled.sort_unstable_by_key(|(index, _)| *index);
            return BatchReport {
                outcomes: settled.into_iter().map(|(_, outcome)| outcome).collect(),
            };
        }

        let mut dispatched: Vec<(usize, Attempt)> = stream::iter(deliveries)
            .enumerate()
            .map(|(index, delivery)| {
                let span = bridge_span(&delivery.message_id, delivery.attempt);
                async move { (index, self.dispatch(delivery).await) }.instrument(span)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        dispatched.sort_unstable_by_key(|(index, _)| *index);
        let attempts: Vec<Attempt> = dispatched.into_iter().map(|(_, attempt)| attempt).collect();

        if attempts.iter().all(|a| a.outcome.is_ok()) {
            let ids: Vec<String> = attempts
                .iter()
                .map(|a| a.delivery.message_id.clone())
                .collect();
            let disposition = match self.queue.ack_all(&ids).await {
                Ok(()) => Disposition::Acked,
                Err(error) => {
                    warn!(error = %error, "batch acknowledgement failed");
                    Disposition::Unsettled { error }
                }
            };
            return BatchReport {
                outcomes: ids.into_iter().map(|id| (id, disposition.clone())).collect(),
            };
        }

        let mut report = BatchReport::default();
        for attempt in attempts {
            let span = bridge_span(&attempt.delivery.message_id, attempt.delivery.attempt);
            let id = attempt.delivery.message_id.clone();
            let disposition = self.settle(attempt).instrument(span).await;
            report.outcomes.push((id, disposition));
        }
        report
    }

    /// Consumes until `cancel` is tripped. Returns the number of messages
    /// processed.
    pub async fn run(&self, cancel: &CancellationToken) -> u64 {
        info!(
            batch_size = self.batch_size,
            max_concurrency = self.max_concurrency,
            "queue bridge started"
        );
        let mut processed: u64 = 0;

        while !cancel.is_cancelled() {
            let idle = match self.process_batch().await {
                Ok(report) => {
                    processed += report.len() as u64;
                    report.is_empty()
                }
                Err(err) => {
                    warn!(error = %err, "receive failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.poll_interval) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }

        info!(processed, "queue bridge stopped");
        processed
    }

    async fn dispatch(&self, delivery: Delivery) -> Attempt {
        let task = match delivery.decode() {
            Ok(task) => task,
            Err(err) => {
                return Attempt {
                    delivery,
                    task: None,
                    outcome: Err(err),
                }
            }
        };
        let outcome = self.invoke(&task).await;
        Attempt {
            delivery,
            task: Some(task),
            outcome,
        }
    }

    async fn invoke(&self, task: &TaskMessage) -> Result<serde_json::Value> {
        let handle = self.gateway.resolve(&task.namespace, &task.destination)?;
        let result = handle.call(&task.operation, task.payload.clone()).await;
        if let Err(ActorflowError::ConcurrentMutation { identity, .. }) = &result {
            // Drop the stale instance so the redelivery reloads from storage.
            self.gateway.evict(identity);
        }
        result
    }

    async fn settle(&self, attempt: Attempt) -> Disposition {
        let Attempt {
            delivery,
            task,
            outcome,
        } = attempt;

        let error = match outcome {
            Ok(_) => {
                return match self.queue.ack(&delivery.message_id).await {
                    Ok(()) => {
                        debug!("message acknowledged");
                        Disposition::Acked
                    }
                    Err(error) => Disposition::Unsettled { error },
                };
            }
            Err(error) => error,
        };

        match self.policy.decide(delivery.attempt, &error) {
            RetryDecision::Retry(delay) => self.redeliver(delivery, delay, error).await,
            RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                self.dead_letter(delivery, task, error).await
            }
        }
    }

    async fn redeliver(
        &self,
        delivery: Delivery,
        delay: Duration,
        error: ActorflowError,
    ) -> Disposition {
        warn!(
            error = %error,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "delivery failed, scheduling redelivery"
        );
        match self.queue.retry(delivery, delay, &error).await {
            Ok(()) => Disposition::Retried { delay, error },
            Err(error) => Disposition::Unsettled { error },
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        task: Option<TaskMessage>,
        error: ActorflowError,
    ) -> Disposition {
        let letter = DeadLetter::new(&delivery, task, error.clone());
        if let Err(sink_err) = self.dead_letters.deposit(letter).await {
            error!(error = %sink_err, "dead-letter deposit failed");
            // Keep the message rather than lose it.
            let delay = self.policy.delay_for(delivery.attempt);
            return self.redeliver(delivery, delay, error).await;
        }

        match self.queue.ack(&delivery.message_id).await {
            Ok(()) => {
                warn!(error = %error, kind = %error.kind(), "message dead-lettered");
                Disposition::DeadLettered { error }
            }
            Err(ack_err) => Disposition::Unsettled { error: ack_err },
        }
    }
}

impl fmt::Debug for QueueBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBridge")
            .field("policy", &self.policy)
            .field("batch_size", &self.batch_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("ack_all", &self.ack_all)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
