//! Queue abstraction consumed by the bridge.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::message::{Delivery, TaskMessage};
use crate::errors::{ActorflowError, Result};

/// How many acknowledged ids [`InMemoryQueue`] remembers.
pub const ACK_LOG_CAPACITY: usize = 1024;

/// A source of task deliveries with explicit settlement.
///
/// Every received delivery must be settled exactly once, by `ack` (or
/// `ack_all`) or by `retry`.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Takes up to `max` deliveries that are due.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Removes a delivered message from the queue.
    async fn ack(&self, message_id: &str) -> Result<()>;

    /// Acknowledges a whole batch in one call.
    async fn ack_all(&self, message_ids: &[String]) -> Result<()> {
        for id in message_ids {
            self.ack(id).await?;
        }
        Ok(())
    }

    /// Redelivers `delivery` after `delay` with its attempt counter bumped
    /// and `error` recorded as its last error.
    async fn retry(
        &self,
        delivery: Delivery,
        delay: Duration,
        error: &ActorflowError,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    delayed: Vec<(Instant, Delivery)>,
    in_flight: HashMap<String, Delivery>,
    acked: VecDeque<String>,
    ack_batches: usize,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, delivery)| {
            if *at <= now {
                due.push((*at, delivery.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, d)| d));
    }
}

/// Process-local queue with delayed redelivery on the tokio clock.
///
/// Only the last [`ACK_LOG_CAPACITY`] acknowledged ids are kept for
/// inspection.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a delivery.
    pub fn push(&self, delivery: Delivery) {
        self.state.lock().ready.push_back(delivery);
    }

    /// Enqueues a task under a fresh message id and returns the id.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the task cannot be encoded.
    pub fn send(&self, task: &TaskMessage) -> Result<String> {
        let delivery = Delivery::for_task(task)?;
        let id = delivery.message_id.clone();
        self.push(delivery);
        Ok(id)
    }

    /// Messages ready for delivery.
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Messages waiting out a retry delay.
    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    /// Messages delivered but not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Returns true when nothing is ready, delayed or in flight.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.ready.is_empty() && state.delayed.is_empty() && state.in_flight.is_empty()
    }

    /// Recently acknowledged message ids, oldest first.
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.iter().cloned().collect()
    }

    /// Number of `ack_all` calls received.
    pub fn ack_batches(&self) -> usize {
        self.state.lock().ack_batches
    }

    /// When the earliest delayed message becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.state.lock().delayed.iter().map(|(at, _)| *at).min()
    }

    fn settle(state: &mut QueueState, message_id: &str) {
        if state.in_flight.remove(message_id).is_some() {
            if state.acked.len() == ACK_LOG_CAPACITY {
                state.acked.pop_front();
            }
            state.acked.push_back(message_id.to_string());
        } else {
            warn!(message_id, "ack for a message that is not in flight");
        }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock();
        state.promote_due(Instant::now());

        let take = max.min(state.ready.len());
        let batch: Vec<Delivery> = state.ready.drain(..take).collect();
        for delivery in &batch {
            state
                .in_flight
                .insert(delivery.message_id.clone(), delivery.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, message_id: &str) -> Result<()> {
        Self::settle(&mut self.state.lock(), message_id);
        Ok(())
    }

    async fn ack_all(&self, message_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.ack_batches += 1;
        for id in message_ids {
            Self::settle(&mut state, id);
        }
        Ok(())
    }

    async fn retry(
        &self,
        delivery: Delivery,
        delay: Duration,
        error: &ActorflowError,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&delivery.message_id);
        let attempt = delivery.attempt.saturating_add(1);
        let next = delivery.with_attempt(attempt).with_last_error(error);
        state.delayed.push((Instant::now() + delay, next));
        Ok(())
    }
}
