//! Error types shared across the worker

use thiserror::Error;

/// Failure of a single handler attempt.
///
/// Every variant consumes a retry attempt; see `RetryPolicy::fail_fast_on_validation`
/// for the only exception.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        match err {
            // A record or header that is not valid JSON is a data problem, not a network one
            TransportError::Json(e) => HandlerError::Serialization(e),
            other => HandlerError::Transport(other),
        }
    }
}

impl HandlerError {
    pub fn is_validation(&self) -> bool {
        matches!(self, HandlerError::Validation(_))
    }
}

/// Blob store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob '{0}' not found")]
    NotFound(String),

    #[error("invalid blob key '{0}'")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device and backend communication errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {addr} failed: {message}")]
    ConnectionFailed { addr: String, message: String },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("device closed the connection before signalling readiness")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code {0}")]
    Status(reqwest::StatusCode),

    #[error("expected JSON body, got '{0}' instead")]
    UnexpectedContentType(String),

    #[error("invalid job record JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Broker and dead-letter channel errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown or expired receipt handle '{0}'")]
    UnknownHandle(String),
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Io(e.to_string())
    }
}

/// Outcome callback errors
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("message has no callback URL")]
    NoCallback,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("callback responded with status {0}")]
    Status(reqwest::StatusCode),
}
