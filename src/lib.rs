//! FabFleet worker: queue consumer for a fleet of fabrication devices
//!
//! Consumes heartbeat, job and upload messages from a durable queue and
//! carries each one out against its target device.
//!
//! ## Architecture
//!
//! - **Processor**: polls the broker, runs one retry loop with exponential
//!   backoff per message, escalates exhausted messages to the dead-letter queue
//! - **Handlers**: heartbeat, job and upload handlers keyed by message type
//! - **Transport**: sync-byte job stream protocol, multipart job upload and the
//!   device HTTP endpoints
//! - **Reporter**: best-effort outcome callbacks to the message origin
//! - **Dead letter**: escalation and the operator drain tool

pub mod blob;
pub mod broker;
pub mod config;
pub mod deadletter;
pub mod error;
pub mod handlers;
pub mod processor;
pub mod reporter;
pub mod transport;
pub mod types;

pub use blob::{BlobStore, FsBlobStore};
pub use broker::{DeadLetterChannel, DirectoryQueue, MemoryQueue, MessageBroker};
pub use config::WorkerConfig;
pub use deadletter::{DeadLetterDrainer, DrainReport};
pub use error::{HandlerError, QueueError, ReportError, StorageError, TransportError};
pub use handlers::{Dispatch, Dispatcher, HandlerSet};
pub use processor::{MessageProcessor, PollReport, ProcessOutcome, ProcessReport};
pub use reporter::{HttpOutcomeReporter, OutcomeReporter};
pub use transport::{DeviceClient, DeviceTransport, JobTransport};
pub use types::{DeadLetterRecord, JobTransferRecord, Message, MessageType};
