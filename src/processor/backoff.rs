//! Retry backoff schedule and the sleep abstraction behind it

use crate::config::RetryPolicy;
use async_trait::async_trait;
use std::time::Duration;

/// Sleeps between two attempts of the same message.
///
/// For `retries` attempts there are `retries - 1` sleeps, starting at the
/// initial backoff and doubling each time. No sleep follows the last attempt.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    next: Duration,
    remaining: u32,
}

impl BackoffSchedule {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            next: policy.initial_backoff(),
            remaining: policy.retries.saturating_sub(1),
        }
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }
}

/// Waits out a backoff delay. Swapped for a recording double in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
