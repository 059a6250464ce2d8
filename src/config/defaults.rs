//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery. Every value here is what the
//! worker uses when no config file sets it.

// ============================================================================
// Retry loop
// ============================================================================

/// Maximum handler attempts per message before it is dead-lettered.
pub const RETRIES: u32 = 5;

/// First inter-retry sleep (seconds). Doubles after every failed attempt.
///
/// With 5 retries the sleeps are 15, 30, 60 and 120 s.
pub const INITIAL_BACKOFF_SECS: u64 = 15;

// ============================================================================
// Devices
// ============================================================================

/// Port the device listens on for job transfers.
pub const DEVICE_JOB_PORT: u16 = 55_555;

/// Port of the device's HTTP API (heartbeat, jobs and identification info).
pub const DEVICE_HTTP_PORT: u16 = 55_555;

/// TCP connect timeout for the job stream (seconds).
pub const DEVICE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read/write deadline for each stage of the job stream protocol (seconds).
pub const DEVICE_STREAM_IO_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// HTTP
// ============================================================================

/// Client timeout for device endpoints, upload forwarding and callbacks (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Worker
// ============================================================================

/// Maximum concurrently processed messages. 0 means unbounded.
pub const MAX_IN_FLIGHT: usize = 0;

/// Directory for downloaded job payloads.
pub const SCRATCH_DIR: &str = "./scratch";

// ============================================================================
// Local queue / blob store
// ============================================================================

pub const MESSAGES_DIR: &str = "./data/queue/messages";
pub const DEAD_LETTER_DIR: &str = "./data/queue/dead_letter";
pub const BLOB_DIR: &str = "./data/blobs";

/// Long-poll wait of a receive call (seconds).
pub const QUEUE_WAIT_TIME_SECS: u64 = 20;

/// Maximum entries returned by one receive call.
pub const QUEUE_BATCH_SIZE: usize = 10;

/// How long a received entry stays hidden before it is redelivered (seconds).
pub const QUEUE_VISIBILITY_TIMEOUT_SECS: u64 = 30;

/// Re-scan interval while long-polling an empty directory queue (milliseconds).
pub const QUEUE_POLL_INTERVAL_MS: u64 = 500;

/// Pause before polling again after a failed receive call (seconds).
pub const RECEIVE_ERROR_BACKOFF_SECS: u64 = 5;
