//! Outcome Reporter — best-effort callbacks to a message's origin
//!
//! Every attempt of a message that carries a `ResultURL` is reported once.
//! Reports are never retried; the processor logs a failed report and moves on.

use crate::error::ReportError;
use crate::types::{now_millis, Message, OutcomeReport};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    /// Send `result` (`SUCCESS` or `FAILURE: ...`) for one attempt of `msg`.
    async fn report(&self, msg: &Message, result: &str) -> Result<(), ReportError>;
}

/// Callback URL for `msg`: `{ResultURL}/{DeviceUUID}/{MessageUUID}`.
pub fn callback_url(msg: &Message) -> Result<String, ReportError> {
    let base = msg.result_url().ok_or(ReportError::NoCallback)?;
    Ok(format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        msg.device_uuid.as_deref().unwrap_or_default(),
        msg.message_uuid.as_deref().unwrap_or_default()
    ))
}

#[derive(Debug, Clone)]
pub struct HttpOutcomeReporter {
    http: reqwest::Client,
}

impl HttpOutcomeReporter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl OutcomeReporter for HttpOutcomeReporter {
    async fn report(&self, msg: &Message, result: &str) -> Result<(), ReportError> {
        let url = callback_url(msg)?;
        let body = OutcomeReport {
            result: result.to_string(),
            timestamp: now_millis(),
        };

        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ReportError::Status(resp.status()));
        }

        debug!(url = %url, result = %result, "Outcome reported");
        Ok(())
    }
}
