//! Message handlers
//!
//! [`HandlerSet`] maps each [`MessageType`](crate::types::MessageType) to its
//! handler. Required fields are checked once, by
//! [`Message::command`](crate::types::Message::command), before any handler
//! runs, so the handlers themselves only see validated values.
//!
//! Handlers are safe to re-run: a retry replays the whole operation.

pub mod heartbeat;
pub mod job;
pub mod upload;

use crate::blob::BlobStore;
use crate::error::HandlerError;
use crate::transport::DeviceTransport;
use crate::types::{DeviceCommand, Message};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// What a successful dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran to completion
    Handled,
    /// Unknown message type, nothing was done
    Skipped,
}

/// Runs one attempt of a message.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, msg: &Message) -> Result<Dispatch, HandlerError>;
}

/// The heartbeat, job and upload handlers with their collaborators.
pub struct HandlerSet {
    blob_store: Arc<dyn BlobStore>,
    transport: Arc<dyn DeviceTransport>,
    scratch_dir: PathBuf,
}

impl HandlerSet {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        transport: Arc<dyn DeviceTransport>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            blob_store,
            transport,
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl Dispatcher for HandlerSet {
    async fn dispatch(&self, msg: &Message) -> Result<Dispatch, HandlerError> {
        let Some(command) = msg.command()? else {
            return Ok(Dispatch::Skipped);
        };

        match command {
            DeviceCommand::Heartbeat { content, address } => {
                heartbeat::handle(self.transport.as_ref(), address, content).await?;
            }
            DeviceCommand::Job {
                file_name,
                blob_key,
                material,
                address,
            } => {
                let job = job::JobRequest {
                    file_name,
                    blob_key,
                    material,
                    address,
                };
                job::handle(
                    self.blob_store.as_ref(),
                    self.transport.as_ref(),
                    &self.scratch_dir,
                    &job,
                )
                .await?;
            }
            DeviceCommand::Upload {
                address,
                resource,
                upload_url,
                device_name,
            } => {
                upload::handle(
                    self.transport.as_ref(),
                    address,
                    resource,
                    upload_url,
                    device_name,
                )
                .await?;
            }
        }

        Ok(Dispatch::Handled)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Recording doubles shared by the handler tests

    use crate::blob::BlobStore;
    use crate::error::{StorageError, TransportError};
    use crate::transport::DeviceTransport;
    use crate::types::{JobTransferRecord, UploadResource};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    #[derive(Default)]
    pub struct MapBlobStore {
        pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MapBlobStore {
        pub fn with_blob(key: &str, data: &[u8]) -> Self {
            let store = Self::default();
            store.blobs.lock().unwrap().insert(key.to_string(), data.to_vec());
            store
        }
    }

    #[async_trait]
    impl BlobStore for MapBlobStore {
        async fn download_file(
            &self,
            key: &str,
            destination: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<u64, StorageError> {
            let data = self
                .blobs
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            destination.write_all(&data).await?;
            Ok(data.len() as u64)
        }

        async fn upload_file(
            &self,
            source: &mut (dyn AsyncRead + Unpin + Send),
            key: &str,
        ) -> Result<u64, StorageError> {
            let mut data = Vec::new();
            source.read_to_end(&mut data).await?;
            let len = data.len() as u64;
            self.blobs.lock().unwrap().insert(key.to_string(), data);
            Ok(len)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Heartbeat(IpAddr, String),
        Job {
            record: JobTransferRecord,
            bytes: Vec<u8>,
            path: std::path::PathBuf,
            address: IpAddr,
        },
        Fetch(IpAddr, UploadResource),
        Forward {
            url: String,
            device: String,
            body: Vec<u8>,
        },
    }

    /// Records every call; fails all of them while `fail` is set.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<Call>>,
        pub fail: bool,
        pub device_info: Vec<u8>,
    }

    impl RecordingTransport {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn outcome(&self) -> Result<(), TransportError> {
            if self.fail {
                Err(TransportError::ConnectionClosed)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DeviceTransport for RecordingTransport {
        async fn send_heartbeat(&self, address: IpAddr, content: &str) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Heartbeat(address, content.to_string()));
            self.outcome()
        }

        async fn send_job(
            &self,
            record: &JobTransferRecord,
            file: &Path,
            address: IpAddr,
        ) -> Result<u64, TransportError> {
            let bytes = tokio::fs::read(file).await?;
            let len = bytes.len() as u64;
            self.calls.lock().unwrap().push(Call::Job {
                record: record.clone(),
                bytes,
                path: file.to_path_buf(),
                address,
            });
            self.outcome().map(|_| len)
        }

        async fn fetch_device_info(
            &self,
            address: IpAddr,
            resource: UploadResource,
        ) -> Result<Vec<u8>, TransportError> {
            self.calls.lock().unwrap().push(Call::Fetch(address, resource));
            self.outcome().map(|_| self.device_info.clone())
        }

        async fn forward_upload(
            &self,
            upload_url: &str,
            device_name: &str,
            body: Vec<u8>,
        ) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Call::Forward {
                url: upload_url.to_string(),
                device: device_name.to_string(),
                body,
            });
            self.outcome()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::MessageType;

    fn handler_set(transport: Arc<RecordingTransport>, scratch: &std::path::Path) -> HandlerSet {
        HandlerSet::new(Arc::new(MapBlobStore::default()), transport, scratch)
    }

    #[tokio::test]
    async fn test_unknown_type_is_skipped_without_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let handlers = handler_set(transport.clone(), tmp.path());

        let msg = Message {
            kind: MessageType::Unknown,
            device_name: "printer-1".to_string(),
            ..Message::default()
        };
        assert_eq!(handlers.dispatch(&msg).await.unwrap(), Dispatch::Skipped);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_call() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let handlers = handler_set(transport.clone(), tmp.path());

        let msg = Message {
            kind: MessageType::Heartbeat,
            target_address: Some("10.0.0.9".to_string()),
            ..Message::default()
        };
        let err = handlers.dispatch(&msg).await.unwrap_err();
        assert!(err.is_validation());
        assert!(transport.calls().is_empty());
    }
}
