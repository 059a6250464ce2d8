//! Job delivery as a multipart POST to the device's `/job` endpoint

use super::JobTransport;
use crate::error::TransportError;
use crate::types::JobTransferRecord;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::info;

/// Content type of the `file` part, chosen from the file name's extension.
///
/// PDFs are always labelled `application/pdf`; everything else goes through
/// extension-based detection and falls back to `application/octet-stream`.
pub fn file_content_type(file_name: &str) -> String {
    let is_pdf = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        return "application/pdf".to_string();
    }
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct MultipartJobTransport {
    http: reqwest::Client,
    port: u16,
}

impl MultipartJobTransport {
    pub fn new(http: reqwest::Client, port: u16) -> Self {
        Self { http, port }
    }

    fn job_url(&self, address: IpAddr) -> String {
        format!("http://{}/job", SocketAddr::new(address, self.port))
    }
}

#[async_trait]
impl JobTransport for MultipartJobTransport {
    async fn send_job(
        &self,
        record: &JobTransferRecord,
        file: &Path,
        address: IpAddr,
    ) -> Result<u64, TransportError> {
        let job_json = serde_json::to_string(record)?;
        let contents = tokio::fs::File::open(file).await?;
        let size = contents.metadata().await?.len();

        // Streamed so large jobs are never held in memory
        let body = reqwest::Body::wrap_stream(ReaderStream::new(contents));
        let file_part = Part::stream_with_length(body, size)
            .file_name(record.file_name.clone())
            .mime_str(&file_content_type(&record.file_name))?;
        let form = Form::new().text("job", job_json).part("file", file_part);

        let url = self.job_url(address);
        let resp = self.http.post(&url).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status()));
        }

        info!(url = %url, file = %record.file_name, bytes = size, "Job posted to device");
        Ok(size)
    }

    fn transport_name(&self) -> &'static str {
        "http"
    }
}
