//! Job handler
//!
//! Downloads the job payload from the blob store into a scratch file and
//! pushes it to the device. The scratch file is a [`tempfile::NamedTempFile`],
//! so it is removed when the handler returns, whether the attempt succeeded
//! or not.

use crate::blob::BlobStore;
use crate::error::{HandlerError, StorageError};
use crate::transport::DeviceTransport;
use crate::types::JobTransferRecord;
use std::net::IpAddr;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Validated fields of a job message.
#[derive(Debug, Clone, Copy)]
pub struct JobRequest<'a> {
    pub file_name: &'a str,
    pub blob_key: &'a str,
    pub material: &'a str,
    pub address: IpAddr,
}

pub async fn handle(
    blob_store: &dyn BlobStore,
    transport: &dyn DeviceTransport,
    scratch_dir: &Path,
    job: &JobRequest<'_>,
) -> Result<u64, HandlerError> {
    tokio::fs::create_dir_all(scratch_dir)
        .await
        .map_err(StorageError::from)?;
    let scratch = tempfile::Builder::new()
        .prefix("job-")
        .tempfile_in(scratch_dir)
        .map_err(StorageError::from)?;

    let mut file = tokio::fs::File::from_std(scratch.reopen().map_err(StorageError::from)?);
    let downloaded = blob_store.download_file(job.blob_key, &mut file).await?;
    file.flush().await.map_err(StorageError::from)?;
    drop(file);
    debug!(
        blob_key = %job.blob_key,
        scratch = %scratch.path().display(),
        bytes = downloaded,
        "Job payload downloaded"
    );

    let record = JobTransferRecord::new(job.file_name, job.material);
    let sent = transport.send_job(&record, scratch.path(), job.address).await?;

    info!(file = %job.file_name, address = %job.address, bytes = sent, "Job delivered");
    Ok(sent)
}
