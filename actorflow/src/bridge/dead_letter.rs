//! Dead-letter destinations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::error;

use super::message::{Delivery, TaskMessage};
use crate::errors::{ActorflowError, ErrorKind, Result};

/// A message the bridge gave up on, with the error that ended it.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Queue message id.
    pub message_id: String,
    /// Attempt that failed last.
    pub attempt: u32,
    /// The decoded task, absent when the body was malformed.
    pub task: Option<TaskMessage>,
    /// The raw body.
    pub body: Vec<u8>,
    /// The last error.
    pub error: ActorflowError,
    /// When it was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead letter for `delivery`.
    #[must_use]
    pub fn new(delivery: &Delivery, task: Option<TaskMessage>, error: ActorflowError) -> Self {
        Self {
            message_id: delivery.message_id.clone(),
            attempt: delivery.attempt,
            task,
            body: delivery.body.clone(),
            error,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Classification of the last error.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Converts to a JSON value.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "message_id": self.message_id,
            "attempt": self.attempt,
            "task": self.task,
            "body": String::from_utf8_lossy(&self.body),
            "error": self.error.to_dict(),
            "dead_lettered_at": self.dead_lettered_at.to_rfc3339(),
        })
    }
}

/// Receives messages that exhausted their retries or can never succeed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Stores a dead letter. The bridge only acknowledges the original
    /// message after this returns `Ok`.
    async fn deposit(&self, letter: DeadLetter) -> Result<()>;
}

/// Keeps dead letters in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All dead letters, oldest first.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Number of dead letters.
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Returns true if nothing was dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    /// Dead letters for one message id.
    pub fn for_message(&self, message_id: &str) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .iter()
            .filter(|l| l.message_id == message_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn deposit(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// Writes dead letters to the error log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn deposit(&self, letter: DeadLetter) -> Result<()> {
        error!(
            message_id = %letter.message_id,
            attempt = letter.attempt,
            error_kind = %letter.error_kind(),
            letter = %letter.to_value(),
            "message dead-lettered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_keeps_letters() {
        let sink = InMemoryDeadLetterSink::new();
        let delivery = Delivery::new("m1", b"garbage".to_vec()).with_attempt(2);
        let err = ActorflowError::malformed("m1", "expected value");

        sink.deposit(DeadLetter::new(&delivery, None, err))
            .await
            .unwrap();

        assert_eq!(sink.len(), 1);
        let letter = &sink.for_message("m1")[0];
        assert_eq!(letter.attempt, 2);
        assert_eq!(letter.error_kind(), ErrorKind::MalformedMessage);
        assert_eq!(letter.to_value()["body"], "garbage");
        assert!(sink.for_message("m2").is_empty());
    }

    #[tokio::test]
    async fn test_logging_sink_accepts() {
        let delivery = Delivery::new("m1", b"{}".to_vec());
        let err = ActorflowError::Storage("disk full".into());
        assert!(LoggingDeadLetterSink
            .deposit(DeadLetter::new(&delivery, None, err))
            .await
            .is_ok());
    }
}
