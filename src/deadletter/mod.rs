//! Dead-letter queue
//!
//! Messages that exhaust their retries end up on the dead-letter channel as a
//! JSON [`DeadLetterRecord`]. [`DeadLetterDrainer`] is the operator tool that
//! prints and deletes them.

pub mod drainer;

pub use drainer::{DeadLetterDrainer, DrainError, DrainReport};

use crate::broker::DeadLetterChannel;
use crate::error::QueueError;
use crate::types::DeadLetterRecord;

/// Serialize `record` and send it to the dead-letter channel.
pub async fn escalate(channel: &dyn DeadLetterChannel, record: &DeadLetterRecord) -> Result<(), QueueError> {
    let body = serde_json::to_string(record).map_err(|e| QueueError::Serialization(e.to_string()))?;
    channel.send_message(&body).await
}
