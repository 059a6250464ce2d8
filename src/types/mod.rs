//! Shared data structures for the device fleet worker
//!
//! - `Message`: the queue entry published by the ingress API
//! - `DeviceCommand`: the validated, per-type view of a `Message`
//! - `JobTransferRecord`: metadata header pushed to a device with a job file
//! - `DeadLetterRecord`: what survives a message that exhausted its retries
//! - `OutcomeReport`: per-attempt callback body sent to the message origin

mod message;
mod records;

pub use message::*;
pub use records::*;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
