//! Worker Configuration - retry policy, device endpoints and local collaborators
//!
//! Each struct implements `Default` with the values in [`super::defaults`], so a
//! missing file or a partial file behaves exactly like the built-in settings.

use super::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "FABFLEET_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "worker_config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration of a worker deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub worker: ProcessingConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl WorkerConfig {
    /// Load configuration using the standard search order:
    /// 1. `$FABFLEET_CONFIG`
    /// 2. `./worker_config.toml`
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded worker config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded worker config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No worker config found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the settings for internal consistency.
    ///
    /// Rules:
    /// - At least one attempt per message
    /// - The longest backoff sleep must fit in a `u64` of seconds
    /// - Batch size, the long-poll wait and all timeouts must be non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.retry.retries == 0 {
            errors.push("retry.retries must be at least 1".to_string());
        } else if self.retry.max_backoff().is_none() {
            errors.push(format!(
                "retry.initial_backoff_secs ({}) overflows when doubled {} times",
                self.retry.initial_backoff_secs,
                self.retry.retries - 2
            ));
        }

        if self.queue.batch_size == 0 {
            errors.push("queue.batch_size must be greater than 0".to_string());
        }
        if self.queue.wait_time_secs == 0 {
            errors.push("queue.wait_time_secs must be greater than 0".to_string());
        }
        if self.queue.visibility_timeout_secs == 0 {
            errors.push("queue.visibility_timeout_secs must be greater than 0".to_string());
        }
        if self.http.timeout_secs == 0 {
            errors.push("http.timeout_secs must be greater than 0".to_string());
        }
        if self.device.connect_timeout_secs == 0 || self.device.stream_io_timeout_secs == 0 {
            errors.push("device timeouts must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Retry Policy
// ============================================================================

/// How often, and how patiently, a failing message is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum handler attempts before the message is dead-lettered
    pub retries: u32,
    /// First inter-retry sleep in seconds, doubled after every failure
    pub initial_backoff_secs: u64,
    /// Send messages that fail validation straight to the dead-letter channel
    /// instead of burning the whole backoff budget on them
    pub fail_fast_on_validation: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: defaults::RETRIES,
            initial_backoff_secs: defaults::INITIAL_BACKOFF_SECS,
            fail_fast_on_validation: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, initial_backoff_secs: u64) -> Self {
        Self {
            retries,
            initial_backoff_secs,
            ..Self::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    /// Longest sleep of the retry loop in seconds.
    ///
    /// `Some(0)` when there is at most one attempt (no sleeps at all) and
    /// `None` if the last sleep does not fit in a `u64`.
    pub fn max_backoff(&self) -> Option<u64> {
        if self.retries <= 1 {
            return Some(0);
        }
        let doublings = self.retries - 2;
        2u64.checked_pow(doublings)
            .and_then(|factor| self.initial_backoff_secs.checked_mul(factor))
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Which job transfer protocol the worker speaks to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTransportKind {
    /// JSON header, one-byte handshake, raw file until EOF over TCP
    #[default]
    Stream,
    /// Multipart POST to the device's `/job` endpoint
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub job_port: u16,
    pub http_port: u16,
    pub job_transport: JobTransportKind,
    pub connect_timeout_secs: u64,
    pub stream_io_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            job_port: defaults::DEVICE_JOB_PORT,
            http_port: defaults::DEVICE_HTTP_PORT,
            job_transport: JobTransportKind::default(),
            connect_timeout_secs: defaults::DEVICE_CONNECT_TIMEOUT_SECS,
            stream_io_timeout_secs: defaults::DEVICE_STREAM_IO_TIMEOUT_SECS,
        }
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stream_io_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_io_timeout_secs)
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::HTTP_TIMEOUT_SECS,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build the shared HTTP client used by every HTTP collaborator.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder().timeout(self.timeout()).build()
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// 0 = one task per received message with no upper bound
    pub max_in_flight: usize,
    pub scratch_dir: PathBuf,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_in_flight: defaults::MAX_IN_FLIGHT,
            scratch_dir: PathBuf::from(defaults::SCRATCH_DIR),
        }
    }
}

// ============================================================================
// Local queue / blob store
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub messages_dir: PathBuf,
    pub dead_letter_dir: PathBuf,
    pub blob_dir: PathBuf,
    pub wait_time_secs: u64,
    pub batch_size: usize,
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            messages_dir: PathBuf::from(defaults::MESSAGES_DIR),
            dead_letter_dir: PathBuf::from(defaults::DEAD_LETTER_DIR),
            blob_dir: PathBuf::from(defaults::BLOB_DIR),
            wait_time_secs: defaults::QUEUE_WAIT_TIME_SECS,
            batch_size: defaults::QUEUE_BATCH_SIZE,
            visibility_timeout_secs: defaults::QUEUE_VISIBILITY_TIMEOUT_SECS,
        }
    }
}
