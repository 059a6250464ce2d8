//! Device transport
//!
//! ## Job delivery
//!
//! Two interchangeable [`JobTransport`]s push a job (metadata + file) to a
//! device and confirm receipt:
//!
//! - **StreamJobTransport**: JSON header on a TCP connection, wait for a
//!   one-byte readiness signal, stream the raw file, close. Framing is the
//!   connection EOF.
//! - **MultipartJobTransport**: one multipart POST with a `job` field (JSON)
//!   and a `file` field.
//!
//! Neither is resumable: a retry re-sends the whole file, so devices must
//! tolerate overwriting a job they already hold.
//!
//! ## Device API
//!
//! [`DeviceClient`] implements [`DeviceTransport`]: heartbeats, device info
//! requests and forwarding of that info to the backend, plus job delivery
//! through whichever `JobTransport` it was built with.

pub mod device;
pub mod multipart;
pub mod stream;

pub use device::DeviceClient;
pub use multipart::MultipartJobTransport;
pub use stream::{receive_job, transfer_job, ReceivedJob, StreamJobTransport};

use crate::error::TransportError;
use crate::types::{JobTransferRecord, UploadResource};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;

/// Pushes one job file to a device.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Deliver `record` followed by the contents of `file`.
    ///
    /// Returns the number of file bytes sent.
    async fn send_job(
        &self,
        record: &JobTransferRecord,
        file: &Path,
        address: IpAddr,
    ) -> Result<u64, TransportError>;

    /// Human-readable name for logging (e.g. "stream", "http").
    fn transport_name(&self) -> &'static str;
}

/// Network operations the message handlers need.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Deliver heartbeat text to a device.
    async fn send_heartbeat(&self, address: IpAddr, content: &str) -> Result<(), TransportError>;

    /// Deliver a job to a device. Returns the number of file bytes sent.
    async fn send_job(
        &self,
        record: &JobTransferRecord,
        file: &Path,
        address: IpAddr,
    ) -> Result<u64, TransportError>;

    /// Ask a device for a JSON document describing `resource`.
    async fn fetch_device_info(
        &self,
        address: IpAddr,
        resource: UploadResource,
    ) -> Result<Vec<u8>, TransportError>;

    /// Forward a device's JSON document to the backend.
    async fn forward_upload(
        &self,
        upload_url: &str,
        device_name: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;
}
