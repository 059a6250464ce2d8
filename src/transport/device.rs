//! Device Client — HTTP client for worker → device communication
//!
//! Handles heartbeats, device info requests and forwarding that info to the
//! backend. Job delivery is delegated to the configured [`JobTransport`].

use super::{DeviceTransport, JobTransport, MultipartJobTransport, StreamJobTransport};
use crate::config::{DeviceConfig, JobTransportKind};
use crate::error::TransportError;
use crate::types::{JobTransferRecord, UploadResource};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Header naming the device a forwarded upload came from.
pub const DEVICE_HEADER: &str = "X-Device";

#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    http_port: u16,
    jobs: Arc<dyn JobTransport>,
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("http_port", &self.http_port)
            .field("jobs", &self.jobs.transport_name())
            .finish_non_exhaustive()
    }
}

impl DeviceClient {
    pub fn new(http: reqwest::Client, http_port: u16, jobs: Arc<dyn JobTransport>) -> Self {
        Self {
            http,
            http_port,
            jobs,
        }
    }

    /// Build a client with the job transport selected in `config`.
    pub fn from_config(http: reqwest::Client, config: &DeviceConfig) -> Self {
        let jobs: Arc<dyn JobTransport> = match config.job_transport {
            JobTransportKind::Stream => Arc::new(StreamJobTransport::new(
                config.job_port,
                config.connect_timeout(),
                config.stream_io_timeout(),
            )),
            JobTransportKind::Http => Arc::new(MultipartJobTransport::new(http.clone(), config.job_port)),
        };
        Self::new(http, config.http_port, jobs)
    }

    pub fn job_transport_name(&self) -> &'static str {
        self.jobs.transport_name()
    }

    fn device_url(&self, address: IpAddr, path: &str) -> String {
        format!("http://{}/{}", SocketAddr::new(address, self.http_port), path)
    }
}

/// `true` if the header names JSON, ignoring parameters such as charset.
fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

#[async_trait]
impl DeviceTransport for DeviceClient {
    async fn send_heartbeat(&self, address: IpAddr, content: &str) -> Result<(), TransportError> {
        let url = self.device_url(address, "heartbeat");
        debug!(url = %url, "Sending heartbeat");

        let resp = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(content.to_string())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status()));
        }

        info!(url = %url, "Heartbeat delivered");
        Ok(())
    }

    async fn send_job(
        &self,
        record: &JobTransferRecord,
        file: &Path,
        address: IpAddr,
    ) -> Result<u64, TransportError> {
        self.jobs.send_job(record, file, address).await
    }

    async fn fetch_device_info(
        &self,
        address: IpAddr,
        resource: UploadResource,
    ) -> Result<Vec<u8>, TransportError> {
        let url = self.device_url(address, resource.path());
        let resp = self.http.get(&url).send().await?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(TransportError::Status(resp.status()));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_json(&content_type) {
            return Err(TransportError::UnexpectedContentType(content_type));
        }

        let body = resp.bytes().await?;
        debug!(url = %url, bytes = body.len(), "Device info received");
        Ok(body.to_vec())
    }

    async fn forward_upload(
        &self,
        upload_url: &str,
        device_name: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(upload_url)
            .header(CONTENT_TYPE, "application/json")
            .header(DEVICE_HEADER, device_name)
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status()));
        }

        info!(url = %upload_url, device = %device_name, "Device info forwarded");
        Ok(())
    }
}
