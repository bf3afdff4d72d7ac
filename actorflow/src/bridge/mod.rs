//! Queue bridge.
//!
//! Turns externally delivered task messages into unit calls and settles each
//! delivery: acknowledged on success, redelivered with exponential backoff
//! on a retryable failure, dead-lettered when retries run out or the failure
//! can never succeed. No delivery is dropped without one of the three.

mod consumer;
mod dead_letter;
mod message;
mod queue;

pub use consumer::{BatchReport, Disposition, QueueBridge};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink};
pub use message::{Delivery, LastError, TaskMessage};
pub use queue::{InMemoryQueue, Queue, ACK_LOG_CAPACITY};
