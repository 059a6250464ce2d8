//! Directory Queue — filesystem-backed broker and dead-letter channel
//!
//! Each entry is a JSON file named `<epoch-ms>-<sequence>-<uuid>.json`, so a
//! sorted directory listing is oldest first. Sends write to a temporary file and
//! rename it into place, so a receiver never sees a half-written entry.
//! Leases live in memory: a received file is hidden until it is removed or
//! its visibility timeout lapses. A restarted worker therefore redelivers
//! whatever was received but not removed.

use super::{DeadLetterChannel, MessageBroker, ReceiptHandle, ReceivedEntry};
use crate::config::{defaults, QueueConfig};
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "json";
const PARTIAL_EXTENSION: &str = "partial";

/// Orders entries sent by this process within the same millisecond
static SEND_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct Lease {
    handle: String,
    deadline: Instant,
}

/// Filesystem-backed queue
#[derive(Debug)]
pub struct DirectoryQueue {
    dir: PathBuf,
    /// file name -> current lease
    leases: Mutex<HashMap<String, Lease>>,
    wait_time: Duration,
    poll_interval: Duration,
    batch_size: usize,
    visibility_timeout: Duration,
}

/// File name of a complete entry, `None` for temporaries and foreign files.
fn entry_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
        return None;
    }
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

impl DirectoryQueue {
    /// Create or open a queue at the given directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let queue = Self {
            dir,
            leases: Mutex::new(HashMap::new()),
            wait_time: Duration::from_secs(defaults::QUEUE_WAIT_TIME_SECS),
            poll_interval: Duration::from_millis(defaults::QUEUE_POLL_INTERVAL_MS),
            batch_size: defaults::QUEUE_BATCH_SIZE,
            visibility_timeout: Duration::from_secs(defaults::QUEUE_VISIBILITY_TIMEOUT_SECS),
        };

        let pending = std::fs::read_dir(&queue.dir)?
            .filter_map(Result::ok)
            .filter(|e| entry_name(&e.path()).is_some())
            .count();
        if pending > 0 {
            info!(dir = %queue.dir.display(), pending = pending, "Directory queue opened with pending entries");
        } else {
            debug!(dir = %queue.dir.display(), "Directory queue opened (empty)");
        }

        Ok(queue)
    }

    /// Open a queue with the wait, batch and visibility settings from `config`.
    pub fn open_with_config<P: AsRef<Path>>(dir: P, config: &QueueConfig) -> Result<Self, QueueError> {
        Ok(Self::open(dir)?
            .with_wait_time(Duration::from_secs(config.wait_time_secs))
            .with_batch_size(config.batch_size)
            .with_visibility_timeout(Duration::from_secs(config.visibility_timeout_secs)))
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of entries on disk, leased or not.
    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.entry_names().await?.len())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sorted names of complete entry files.
    async fn entry_names(&self) -> Result<Vec<String>, QueueError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry_name(&entry.path()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn take_batch(&self) -> Result<Vec<ReceivedEntry>, QueueError> {
        let names = self.entry_names().await?;
        let now = Instant::now();

        let candidates: Vec<String> = {
            let mut leases = self.lock();
            leases.retain(|_, lease| lease.deadline > now);
            names
                .into_iter()
                .filter(|name| !leases.contains_key(name))
                .take(self.batch_size)
                .collect()
        };

        let mut batch = Vec::with_capacity(candidates.len());
        for name in candidates {
            let body = match tokio::fs::read_to_string(self.dir.join(&name)).await {
                Ok(body) => body,
                Err(e) => {
                    // Removed by another receiver between listing and reading.
                    debug!(entry = %name, error = %e, "Skipping unreadable queue entry");
                    continue;
                }
            };

            let handle = format!("{}#{}", name, uuid::Uuid::new_v4());
            let mut leases = self.lock();
            if leases.contains_key(&name) {
                continue;
            }
            leases.insert(
                name,
                Lease {
                    handle: handle.clone(),
                    deadline: Instant::now() + self.visibility_timeout,
                },
            );
            batch.push(ReceivedEntry {
                body,
                handle: ReceiptHandle::new(handle),
            });
        }

        Ok(batch)
    }
}

#[async_trait]
impl MessageBroker for DirectoryQueue {
    async fn receive_messages(&self) -> Result<Vec<ReceivedEntry>, QueueError> {
        let deadline = Instant::now() + self.wait_time;
        loop {
            let batch = self.take_batch().await?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn remove_message(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let Some((name, _)) = handle.as_str().split_once('#') else {
            return Err(QueueError::UnknownHandle(handle.to_string()));
        };

        {
            let mut leases = self.lock();
            match leases.get(name) {
                Some(lease) if lease.handle == handle.as_str() => {
                    leases.remove(name);
                }
                _ => return Err(QueueError::UnknownHandle(handle.to_string())),
            }
        }

        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(entry = %name, "Queue entry already gone on removal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DeadLetterChannel for DirectoryQueue {
    async fn send_message(&self, body: &str) -> Result<(), QueueError> {
        let stem = format!(
            "{:013}-{:010}-{}",
            chrono::Utc::now().timestamp_millis(),
            SEND_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            uuid::Uuid::new_v4()
        );
        let partial = self.dir.join(format!("{stem}.{PARTIAL_EXTENSION}"));
        let entry = self.dir.join(format!("{stem}.{ENTRY_EXTENSION}"));

        tokio::fs::write(&partial, body.as_bytes()).await?;
        tokio::fs::rename(&partial, &entry).await?;

        debug!(entry = %entry.display(), size_bytes = body.len(), "Queue entry written");
        Ok(())
    }
}
