//! Wire records derived from a [`Message`]

use super::message::{Message, MessageType};
use serde::{Deserialize, Serialize};

/// Result string reported for a successful attempt.
pub const SUCCESS: &str = "SUCCESS";

/// Prefix of every failed-attempt result string.
pub const FAILURE_PREFIX: &str = "FAILURE: ";

/// Format a failed attempt's result string.
pub fn failure_result(error: &impl std::fmt::Display) -> String {
    format!("{FAILURE_PREFIX}{error}")
}

/// Job metadata pushed to a device ahead of the job file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransferRecord {
    #[serde(rename = "filename")]
    pub file_name: String,
    pub material: String,
}

impl JobTransferRecord {
    pub fn new(file_name: &str, material: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            material: material.to_string(),
        }
    }
}

/// Persisted on the dead-letter channel when a message exhausts its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "AdditionalInfo", default)]
    pub additional_info: String,
    #[serde(rename = "DeviceName", default)]
    pub device_name: String,
    /// Always carries the [`FAILURE_PREFIX`]
    #[serde(rename = "LastResult", default)]
    pub last_result: String,
    /// Unix epoch milliseconds
    #[serde(rename = "Timestamp", default)]
    pub timestamp: i64,
}

impl DeadLetterRecord {
    pub fn from_failure(msg: &Message, last_error: &impl std::fmt::Display, timestamp: i64) -> Self {
        Self {
            kind: msg.kind,
            additional_info: msg.additional_info().to_string(),
            device_name: msg.device_name.clone(),
            last_result: failure_result(last_error),
            timestamp,
        }
    }
}

/// Body of an outcome callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    #[serde(rename = "Result")]
    pub result: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
}
