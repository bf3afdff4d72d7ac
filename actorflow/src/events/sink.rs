//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, Level};

use super::record::EventRecord;

/// Receives published events.
///
/// Publication is best-effort. Implementations must not panic and must not
/// surface errors to the publisher.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes an event, waiting for the sink to accept it.
    async fn emit(&self, event: EventRecord);

    /// Publishes an event without blocking.
    fn try_emit(&self, event: EventRecord);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: EventRecord) {}

    fn try_emit(&self, _event: EventRecord) {}
}

/// Mirrors events into the `tracing` log.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`; anything but DEBUG logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &EventRecord) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                identity = %event.identity,
                result = ?event.result,
                error = ?event.error,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                event_type = %event.event_type,
                identity = %event.identity,
                result = ?event.result,
                error = ?event.error,
                "Event: {}", event.event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: EventRecord) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: EventRecord) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<EventRecord>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.read().clone()
    }

    /// Returns the collected event types in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.event_type.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<EventRecord> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: EventRecord) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: EventRecord) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UnitIdentity;

    fn record(event_type: &str) -> EventRecord {
        EventRecord::new(event_type, &UnitIdentity::derive("pipeline", "wf_1", None))
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(record("pipeline.started")).await;
        sink.try_emit(record("pipeline.completed"));
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::debug();
        sink.emit(record("pipeline.failed").with_error(serde_json::json!("boom")))
            .await;
        LoggingEventSink::info().try_emit(record("pipeline.completed"));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(record("pipeline.started")).await;
        sink.try_emit(record("pipeline.completed"));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.event_types(), vec!["pipeline.started", "pipeline.completed"]);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        sink.emit(record("pipeline.started")).await;
        sink.emit(record("pipeline.step_completed")).await;
        sink.emit(record("bridge.dead_lettered")).await;

        assert_eq!(sink.events_of_type("pipeline.").len(), 2);
        assert_eq!(sink.events_of_type("bridge.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
