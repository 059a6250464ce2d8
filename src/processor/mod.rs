//! Message Processor — queue intake and the per-message retry loop
//!
//! ## Intake
//!
//! Each poll receives a batch from the broker. Every entry is decoded, removed
//! from the broker right away and handed to its own task. Entries that do not
//! decode are left on the broker, which redelivers them after its visibility
//! timeout. The intake never waits for a message task to finish.
//!
//! Removing before processing means a crash mid-retry loses the message, but
//! the broker can never hand the same entry to a second retry loop while the
//! first is still backing off.
//!
//! ## Retry loop
//!
//! A message is dispatched up to `retries` times with a doubling sleep
//! between attempts (see [`BackoffSchedule`]). Every attempt of a message
//! that carries a `ResultURL` is reported to its origin. When the last
//! attempt fails, a [`DeadLetterRecord`] is sent to the dead-letter channel.

pub mod backoff;

pub use backoff::{BackoffSchedule, Sleeper, TokioSleeper};

use crate::broker::{DeadLetterChannel, MessageBroker, ReceivedEntry};
use crate::config::{defaults, RetryPolicy};
use crate::deadletter;
use crate::error::{HandlerError, QueueError, ReportError};
use crate::handlers::{Dispatch, Dispatcher};
use crate::reporter::OutcomeReporter;
use crate::types::{failure_result, now_millis, DeadLetterRecord, Message, SUCCESS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How a message's retry loop ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// A handler succeeded on attempt `attempts`
    Succeeded { attempts: u32 },
    /// Unknown message type: one no-op attempt, treated as a success
    Skipped,
    /// Retries exhausted, record stored on the dead-letter channel
    DeadLettered {
        attempts: u32,
        record: DeadLetterRecord,
    },
    /// Retries exhausted and the dead-letter send failed too; the message is lost
    DeadLetterFailed {
        attempts: u32,
        record: DeadLetterRecord,
        error: QueueError,
    },
}

impl ProcessOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ProcessOutcome::Skipped => 1,
            ProcessOutcome::Succeeded { attempts }
            | ProcessOutcome::DeadLettered { attempts, .. }
            | ProcessOutcome::DeadLetterFailed { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Succeeded { .. } | ProcessOutcome::Skipped)
    }
}

/// Result of one message task.
#[derive(Debug)]
pub struct ProcessReport {
    pub outcome: ProcessOutcome,
    /// Outcome callbacks that could not be delivered, in attempt order
    pub report_failures: Vec<ReportError>,
}

/// What one poll of the broker did.
#[derive(Debug, Default)]
pub struct PollReport {
    pub received: usize,
    /// Entries that did not decode and were left on the broker
    pub malformed: usize,
    /// Entries whose removal failed (they were processed anyway)
    pub remove_failures: usize,
    /// One task per decoded message
    pub tasks: Vec<JoinHandle<ProcessReport>>,
}

/// State shared by every message task.
struct RetryLoop {
    dead_letters: Arc<dyn DeadLetterChannel>,
    dispatcher: Arc<dyn Dispatcher>,
    reporter: Arc<dyn OutcomeReporter>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl RetryLoop {
    async fn run(&self, msg: &Message) -> ProcessReport {
        let retries = self.policy.retries.max(1);
        let mut delays = BackoffSchedule::new(&self.policy);
        let mut report_failures = Vec::new();
        let mut attempt = 0;

        let (attempts, last_error) = loop {
            attempt += 1;
            let err = match self.dispatcher.dispatch(msg).await {
                Ok(dispatch) => {
                    let outcome = match dispatch {
                        Dispatch::Handled => {
                            info!(
                                message_uuid = %msg.log_id(),
                                kind = %msg.kind,
                                attempt = attempt,
                                "Message processed"
                            );
                            ProcessOutcome::Succeeded { attempts: attempt }
                        }
                        Dispatch::Skipped => {
                            info!(message_uuid = %msg.log_id(), "Unknown message type, nothing to do");
                            ProcessOutcome::Skipped
                        }
                    };
                    self.report(msg, SUCCESS, &mut report_failures).await;
                    return ProcessReport {
                        outcome,
                        report_failures,
                    };
                }
                Err(e) => e,
            };

            warn!(
                message_uuid = %msg.log_id(),
                kind = %msg.kind,
                attempt = attempt,
                retries = retries,
                error = %err,
                "Attempt failed"
            );
            self.report(msg, &failure_result(&err), &mut report_failures).await;

            if attempt >= retries {
                break (attempt, err);
            }
            if self.skips_retries(&err) {
                warn!(message_uuid = %msg.log_id(), "Invalid message, skipping remaining retries");
                break (attempt, err);
            }
            if let Some(delay) = delays.next() {
                debug!(message_uuid = %msg.log_id(), delay_secs = delay.as_secs(), "Backing off");
                self.sleeper.sleep(delay).await;
            }
        };

        let outcome = self.escalate(msg, attempts, &last_error).await;
        ProcessReport {
            outcome,
            report_failures,
        }
    }

    fn skips_retries(&self, err: &HandlerError) -> bool {
        self.policy.fail_fast_on_validation && err.is_validation()
    }

    async fn report(&self, msg: &Message, result: &str, failures: &mut Vec<ReportError>) {
        if msg.result_url().is_none() {
            return;
        }
        if let Err(e) = self.reporter.report(msg, result).await {
            warn!(message_uuid = %msg.log_id(), error = %e, "Outcome report failed");
            failures.push(e);
        }
    }

    async fn escalate(&self, msg: &Message, attempts: u32, last_error: &HandlerError) -> ProcessOutcome {
        let record = DeadLetterRecord::from_failure(msg, last_error, now_millis());
        error!(
            message_uuid = %msg.log_id(),
            kind = %msg.kind,
            device = %msg.device_name,
            attempts = attempts,
            error = %last_error,
            "Retries exhausted, moving message to the dead-letter queue"
        );

        match deadletter::escalate(self.dead_letters.as_ref(), &record).await {
            Ok(()) => ProcessOutcome::DeadLettered { attempts, record },
            Err(error) => {
                error!(
                    message_uuid = %msg.log_id(),
                    error = %error,
                    "Dead-letter send failed, message is lost"
                );
                ProcessOutcome::DeadLetterFailed {
                    attempts,
                    record,
                    error,
                }
            }
        }
    }
}

/// Consumes the broker and runs one retry loop per message.
///
/// Built with [`new()`](MessageProcessor::new), optionally adjusted with
/// [`with_sleeper()`](MessageProcessor::with_sleeper) and
/// [`with_max_in_flight()`](MessageProcessor::with_max_in_flight), then driven
/// by [`run()`](MessageProcessor::run) or [`poll_once()`](MessageProcessor::poll_once).
pub struct MessageProcessor {
    broker: Arc<dyn MessageBroker>,
    retry_loop: Arc<RetryLoop>,
    limit: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl MessageProcessor {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        dead_letters: Arc<dyn DeadLetterChannel>,
        dispatcher: Arc<dyn Dispatcher>,
        reporter: Arc<dyn OutcomeReporter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            retry_loop: Arc::new(RetryLoop {
                dead_letters,
                dispatcher,
                reporter,
                sleeper: Arc::new(TokioSleeper),
                policy,
            }),
            limit: None,
            tracker: TaskTracker::new(),
        }
    }

    /// Replace the backoff sleeper.
    ///
    /// Must be called before any message is processed.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        if let Some(retry_loop) = Arc::get_mut(&mut self.retry_loop) {
            retry_loop.sleeper = sleeper;
        }
        self
    }

    /// Cap the number of messages processed at once (0 = unbounded).
    ///
    /// Tasks over the cap are still spawned but wait for a permit, so the
    /// intake keeps polling.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.limit = (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight)));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_loop.policy
    }

    /// Run the retry loop for one message on the current task.
    pub async fn process_message(&self, msg: &Message) -> ProcessReport {
        self.retry_loop.run(msg).await
    }

    /// Receive one batch and start a task for every decodable entry.
    pub async fn poll_once(&self) -> Result<PollReport, QueueError> {
        let entries = self.broker.receive_messages().await?;
        Ok(self.intake(entries).await)
    }

    async fn intake(&self, entries: Vec<ReceivedEntry>) -> PollReport {
        let mut report = PollReport {
            received: entries.len(),
            ..PollReport::default()
        };

        for entry in entries {
            let msg: Message = match serde_json::from_str(&entry.body) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(handle = %entry.handle, error = %e, "Malformed message left on the queue");
                    report.malformed += 1;
                    continue;
                }
            };

            if let Err(e) = self.broker.remove_message(&entry.handle).await {
                warn!(
                    message_uuid = %msg.log_id(),
                    handle = %entry.handle,
                    error = %e,
                    "Failed to remove message from the queue, processing anyway"
                );
                report.remove_failures += 1;
            }

            report.tasks.push(self.spawn(msg));
        }

        report
    }

    fn spawn(&self, msg: Message) -> JoinHandle<ProcessReport> {
        let retry_loop = Arc::clone(&self.retry_loop);
        let limit = self.limit.clone();
        self.tracker.spawn(async move {
            let _permit = match limit {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            retry_loop.run(&msg).await
        })
    }

    /// Poll until `cancel` fires, then wait for in-flight messages.
    ///
    /// Cancellation only interrupts the wait for the next batch; a batch that
    /// has been received is always handed to its tasks.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            retries = self.retry_loop.policy.retries,
            initial_backoff_secs = self.retry_loop.policy.initial_backoff_secs,
            "Message processor started"
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.broker.receive_messages() => result,
            };

            match received {
                Ok(entries) => {
                    if entries.is_empty() {
                        // A broker without long-poll returns at once
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_millis(defaults::QUEUE_POLL_INTERVAL_MS)) => {}
                        }
                        continue;
                    }
                    let report = self.intake(entries).await;
                    debug!(
                        received = report.received,
                        malformed = report.malformed,
                        remove_failures = report.remove_failures,
                        "Batch dispatched"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive messages");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(defaults::RECEIVE_ERROR_BACKOFF_SECS)) => {}
                    }
                }
            }
        }

        info!(in_flight = self.tracker.len(), "Shutdown requested, waiting for in-flight messages");
        self.shutdown().await;
        info!("Message processor stopped");
    }

    /// Stop accepting tasks and wait for the ones already running.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
