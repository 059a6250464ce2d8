//! Dead-letter drain: print every record, delete it, stop when the queue is empty
//!
//! Runs alone, outside the processing pipeline. There is no retry or backoff:
//! a record that cannot be deleted is counted and the drain carries on.

use crate::broker::DeadLetterChannel;
use crate::error::QueueError;
use crate::types::{DeadLetterRecord, MessageType};
use chrono::{Local, TimeZone};
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Printed once the final poll comes back empty.
pub const DRAIN_COMPLETE: &str =
    "All messages have been shown and deleted. Dead Letter Queue is now empty.";

const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("dead-letter queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries printed, including unreadable ones
    pub displayed: usize,
    pub deleted: usize,
    /// Entries that were not a valid record and were printed raw
    pub malformed: usize,
    pub delete_failures: usize,
}

/// Format epoch milliseconds as `dd/mm/YYYY HH:MM:SS` in `tz`.
pub fn format_timestamp<Tz>(millis: i64, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    match tz.timestamp_millis_opt(millis).single() {
        Some(time) => time.format(TIMESTAMP_FORMAT).to_string(),
        None => millis.to_string(),
    }
}

/// Label of the type-specific line of a record.
fn info_label(kind: MessageType) -> Option<&'static str> {
    match kind {
        MessageType::Heartbeat => Some("Associated message"),
        MessageType::Job => Some("Attached file"),
        MessageType::Upload => Some("Requested information"),
        MessageType::Unknown => None,
    }
}

/// Write the human-readable summary of one record.
pub fn write_record<W: Write>(out: &mut W, record: &DeadLetterRecord, timestamp: &str) -> std::io::Result<()> {
    writeln!(out, "Message processed on {timestamp}")?;
    writeln!(out, "\tDevice Name: {}", record.device_name)?;
    writeln!(out, "\tType: {}", record.kind)?;
    if let Some(label) = info_label(record.kind) {
        writeln!(out, "\t{label}: {}", record.additional_info)?;
    }
    writeln!(out, "\tLast Recorded Result: {}", record.last_result)?;
    writeln!(out)
}

pub struct DeadLetterDrainer<W: Write> {
    channel: Arc<dyn DeadLetterChannel>,
    out: W,
}

impl<W: Write> DeadLetterDrainer<W> {
    pub fn new(channel: Arc<dyn DeadLetterChannel>, out: W) -> Self {
        Self { channel, out }
    }

    /// Print and delete records until a poll comes back empty.
    pub async fn drain(&mut self) -> Result<DrainReport, DrainError> {
        let mut report = DrainReport::default();

        loop {
            let batch = self.channel.receive_messages().await?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                match serde_json::from_str::<DeadLetterRecord>(&entry.body) {
                    Ok(record) => {
                        let timestamp = format_timestamp(record.timestamp, &Local);
                        write_record(&mut self.out, &record, &timestamp)?;
                    }
                    Err(e) => {
                        warn!(handle = %entry.handle, error = %e, "Unreadable dead-letter entry");
                        writeln!(self.out, "Unreadable dead-letter entry: {}\n", entry.body)?;
                        report.malformed += 1;
                    }
                }
                report.displayed += 1;

                match self.channel.remove_message(&entry.handle).await {
                    Ok(()) => {
                        writeln!(self.out, "Message was deleted successfully\n\n")?;
                        report.deleted += 1;
                    }
                    Err(e) => {
                        warn!(handle = %entry.handle, error = %e, "Failed to delete dead-letter entry");
                        writeln!(self.out, "Failed to delete message: {e}\n")?;
                        report.delete_failures += 1;
                    }
                }
            }
        }

        writeln!(self.out, "{DRAIN_COMPLETE}")?;
        self.out.flush()?;
        info!(
            displayed = report.displayed,
            deleted = report.deleted,
            malformed = report.malformed,
            "Dead-letter queue drained"
        );
        Ok(report)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
