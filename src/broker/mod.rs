//! Message broker abstraction
//!
//! The worker consumes an at-least-once queue: a receive call hands out a
//! batch of entries, each entry stays invisible to other receivers until it
//! is explicitly removed or its visibility timeout lapses, after which the
//! broker redelivers it.
//!
//! - **MessageBroker**: receive-batch plus per-entry removal
//! - **DeadLetterChannel**: the same shape plus send
//! - **DirectoryQueue**: one JSON file per entry in a directory
//! - **MemoryQueue**: in-process queue, used for embedding and as a test double
//!
//! Implementations must tolerate concurrent use from any number of tasks.

pub mod directory;
pub mod memory;

pub use directory::DirectoryQueue;
pub use memory::MemoryQueue;

use crate::error::QueueError;
use async_trait::async_trait;
use std::fmt;

/// Opaque token identifying one delivery of a broker entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry handed out by a receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEntry {
    pub body: String,
    pub handle: ReceiptHandle,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Receive the next batch of entries.
    ///
    /// Blocks for at most the broker's long-poll wait and returns an empty
    /// batch if nothing arrived in that time.
    async fn receive_messages(&self) -> Result<Vec<ReceivedEntry>, QueueError>;

    /// Acknowledge an entry so it is never redelivered.
    async fn remove_message(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;
}

#[async_trait]
pub trait DeadLetterChannel: MessageBroker {
    async fn send_message(&self, body: &str) -> Result<(), QueueError>;
}
