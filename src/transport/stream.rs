//! Job stream protocol
//!
//! Sender side, over any ordered byte stream:
//!
//! 1. write the JSON [`JobTransferRecord`]
//! 2. read exactly one byte: the device created the destination file and is
//!    ready (the value carries no meaning)
//! 3. write the raw file bytes
//! 4. shut down the write half; EOF ends the file
//!
//! There is no length prefix, so a substitute transport must keep ordered
//! delivery with EOF or add its own framing. Every stage runs under an I/O
//! deadline so an unresponsive device cannot hold a worker task forever.

use super::JobTransport;
use crate::error::TransportError;
use crate::types::JobTransferRecord;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Byte a receiver sends once the destination file exists.
pub const SYNC_BYTE: u8 = 0;

/// Largest job header a receiver accepts.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

const CHUNK_SIZE: usize = 64 * 1024;

/// Run the sender side of the protocol on an already connected stream.
///
/// `io_timeout` bounds each individual read or write, not the whole
/// transfer, so large files are fine as long as the device keeps up.
pub async fn transfer_job<S, F>(
    stream: &mut S,
    record: &JobTransferRecord,
    file: &mut F,
    io_timeout: Duration,
) -> Result<u64, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    F: AsyncRead + Unpin + ?Sized,
{
    let header = serde_json::to_vec(record)?;
    with_deadline(io_timeout, "sending the job header", async {
        stream.write_all(&header).await?;
        stream.flush().await
    })
    .await?;

    let mut sync = [0u8; 1];
    let n = with_deadline(io_timeout, "waiting for the device to get ready", stream.read(&mut sync)).await?;
    if n == 0 {
        return Err(TransportError::ConnectionClosed);
    }

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        with_deadline(io_timeout, "streaming the job file", stream.write_all(&buf[..n])).await?;
        sent += n as u64;
    }

    with_deadline(io_timeout, "closing the job stream", stream.shutdown()).await?;
    Ok(sent)
}

async fn with_deadline<T>(
    limit: Duration,
    stage: &'static str,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T, TransportError> {
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::Timeout(stage)),
    }
}

/// A job accepted by [`receive_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedJob {
    pub record: JobTransferRecord,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Run the device side of the protocol: read the header, create the file in
/// `dest_dir` (overwriting a previous copy), signal readiness and store
/// everything up to EOF.
pub async fn receive_job<S>(stream: &mut S, dest_dir: &Path) -> Result<ReceivedJob, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut header = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];

    let (record, consumed) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        header.extend_from_slice(&chunk[..n]);

        let mut parsed = serde_json::Deserializer::from_slice(&header).into_iter::<JobTransferRecord>();
        match parsed.next() {
            Some(Ok(record)) => break (record, parsed.byte_offset()),
            Some(Err(e)) if e.is_eof() && header.len() < MAX_HEADER_BYTES => continue,
            Some(Err(e)) => return Err(TransportError::Json(e)),
            None => continue,
        }
    };

    let file_name = Path::new(&record.file_name)
        .file_name()
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid job file name '{}'", record.file_name),
            ))
        })?
        .to_owned();
    let path = dest_dir.join(file_name);
    let mut file = tokio::fs::File::create(&path).await?;

    // Bytes that arrived together with the header belong to the file.
    let leftover = &header[consumed..];
    file.write_all(leftover).await?;

    stream.write_all(&[SYNC_BYTE]).await?;
    stream.flush().await?;

    let streamed = tokio::io::copy(stream, &mut file).await?;
    file.flush().await?;

    let bytes = leftover.len() as u64 + streamed;
    debug!(file = %path.display(), bytes = bytes, "Job received");
    Ok(ReceivedJob { record, path, bytes })
}

/// Sender side of the protocol over TCP.
#[derive(Debug, Clone)]
pub struct StreamJobTransport {
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl StreamJobTransport {
    pub fn new(port: u16, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            io_timeout,
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout("connecting to the device"))?
            .map_err(|e| TransportError::ConnectionFailed {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;

        // Keepalive to detect devices that vanished mid-transfer
        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        let _ = sock_ref.set_tcp_keepalive(&keepalive);
        let _ = stream.set_nodelay(true);

        Ok(stream)
    }
}

#[async_trait]
impl JobTransport for StreamJobTransport {
    async fn send_job(
        &self,
        record: &JobTransferRecord,
        file: &Path,
        address: IpAddr,
    ) -> Result<u64, TransportError> {
        let addr = SocketAddr::new(address, self.port);
        let mut source = tokio::fs::File::open(file).await?;

        debug!(address = %addr, file = %record.file_name, "Connecting to device job port");
        let mut stream = self.connect(addr).await?;
        let sent = transfer_job(&mut stream, record, &mut source, self.io_timeout).await?;

        info!(address = %addr, file = %record.file_name, bytes = sent, "Job streamed to device");
        Ok(sent)
    }

    fn transport_name(&self) -> &'static str {
        "stream"
    }
}
