//! Bounded channel sink for handing events to an external publisher.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use super::record::EventRecord;
use super::sink::EventSink;

/// Counters for a [`ChannelEventSink`].
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl DeliveryMetrics {
    fn record_emit(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Events handed to the channel.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "emitted": self.emitted(),
            "dropped": self.dropped(),
        })
    }
}

/// Forwards events into a bounded `mpsc` channel.
///
/// The receiving end belongs to whatever publishes events outside the
/// process. `try_emit` drops the event when the channel is full; `emit`
/// waits for capacity.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<EventRecord>,
    metrics: Arc<DeliveryMetrics>,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver it feeds.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                metrics: Arc::new(DeliveryMetrics::default()),
            },
            rx,
        )
    }

    /// Returns the delivery counters.
    #[must_use]
    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: EventRecord) {
        if self.tx.send(event).await.is_ok() {
            self.metrics.record_emit();
        } else {
            self.metrics.record_drop();
        }
    }

    fn try_emit(&self, event: EventRecord) {
        let event_type = event.event_type.clone();
        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_emit(),
            Err(e) => {
                self.metrics.record_drop();
                warn!(
                    event_type = %event_type,
                    dropped_total = self.metrics.dropped(),
                    reason = %e,
                    "Event dropped"
                );
            }
        }
    }
}
