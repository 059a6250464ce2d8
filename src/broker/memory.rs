//! In-process queue with the same delivery semantics as the real brokers

use super::{DeadLetterChannel, MessageBroker, ReceiptHandle, ReceivedEntry};
use crate::config::defaults;
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    /// handle -> (body, visibility deadline)
    in_flight: HashMap<String, (String, Instant)>,
    deliveries: u64,
}

impl QueueState {
    /// Move entries whose visibility timeout lapsed back to the front.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some((body, _)) = self.in_flight.remove(&handle) {
                self.ready.push_front(body);
            }
        }
    }
}

/// In-memory at-least-once queue.
///
/// A receive call waits up to `wait_time` for entries to arrive (zero by
/// default, so an empty queue returns immediately).
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    arrived: Notify,
    wait_time: Duration,
    batch_size: usize,
    visibility_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            arrived: Notify::new(),
            wait_time: Duration::ZERO,
            batch_size: defaults::QUEUE_BATCH_SIZE,
            visibility_timeout: Duration::from_secs(defaults::QUEUE_VISIBILITY_TIMEOUT_SECS),
        }
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Enqueue a body.
    pub fn push(&self, body: impl Into<String>) {
        self.lock().ready.push_back(body.into());
        self.arrived.notify_one();
    }

    /// Entries waiting to be received.
    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    /// Entries received but not yet removed.
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Entries not yet removed, received or not.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the bodies waiting to be received.
    pub fn ready_bodies(&self) -> Vec<String> {
        self.lock().ready.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_batch(&self) -> Vec<ReceivedEntry> {
        let now = Instant::now();
        let mut state = self.lock();
        state.requeue_expired(now);

        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            let Some(body) = state.ready.pop_front() else {
                break;
            };
            state.deliveries += 1;
            let handle = format!("mem-{}", state.deliveries);
            state
                .in_flight
                .insert(handle.clone(), (body.clone(), now + self.visibility_timeout));
            batch.push(ReceivedEntry {
                body,
                handle: ReceiptHandle::new(handle),
            });
        }
        batch
    }
}

#[async_trait]
impl MessageBroker for MemoryQueue {
    async fn receive_messages(&self) -> Result<Vec<ReceivedEntry>, QueueError> {
        let deadline = Instant::now() + self.wait_time;
        loop {
            let batch = self.take_batch();
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(batch);
            }
            // Either something arrives or the wait runs out.
            let _ = tokio::time::timeout(remaining, self.arrived.notified()).await;
        }
    }

    async fn remove_message(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        match self.lock().in_flight.remove(handle.as_str()) {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownHandle(handle.to_string())),
        }
    }
}

#[async_trait]
impl DeadLetterChannel for MemoryQueue {
    async fn send_message(&self, body: &str) -> Result<(), QueueError> {
        self.push(body);
        Ok(())
    }
}
