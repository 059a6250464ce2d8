//! Queue message and its per-type validated view

use crate::error::HandlerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Discriminant of a queue message.
///
/// Anything the worker does not recognise (including a missing `type` key)
/// deserialises to `Unknown` instead of failing the whole entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Heartbeat,
    Job,
    Upload,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Heartbeat => write!(f, "HEARTBEAT"),
            MessageType::Job => write!(f, "JOB"),
            MessageType::Upload => write!(f, "UPLOAD"),
            MessageType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A unit of work as published on the message queue.
///
/// Which optional fields must be present depends on `kind`; see
/// [`Message::command`]. The value is never mutated once decoded, every retry
/// replays the same message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub kind: MessageType,

    /// Heartbeat text
    #[serde(rename = "message", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(rename = "filename", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Object-store key of the job payload
    #[serde(rename = "s3name", default, skip_serializing_if = "Option::is_none")]
    pub blob_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,

    #[serde(rename = "IPAddress", default, skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,

    #[serde(rename = "UploadInfo", default, skip_serializing_if = "Option::is_none")]
    pub upload_info: Option<String>,

    #[serde(rename = "UploadURL", default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,

    #[serde(rename = "DeviceName", default)]
    pub device_name: String,

    #[serde(rename = "DeviceUUID", default, skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<String>,

    /// Correlation key assigned at ingestion. Older producers emit it under a
    /// misspelt key, which is still accepted.
    #[serde(
        rename = "MessageUUID",
        alias = "MeviceUUID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub message_uuid: Option<String>,

    /// Base URL for outcome callbacks
    #[serde(rename = "ResultURL", default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
}

/// Device resource an upload message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResource {
    Jobs,
    Identification,
}

impl UploadResource {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Jobs" => Some(Self::Jobs),
            "Identification" => Some(Self::Identification),
            _ => None,
        }
    }

    /// Path segment of the device endpoint serving this resource.
    pub fn path(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Identification => "identification",
        }
    }
}

/// Validated, per-type view of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand<'a> {
    Heartbeat {
        content: &'a str,
        address: IpAddr,
    },
    Job {
        file_name: &'a str,
        blob_key: &'a str,
        material: &'a str,
        address: IpAddr,
    },
    Upload {
        address: IpAddr,
        resource: UploadResource,
        upload_url: &'a str,
        device_name: &'a str,
    },
}

impl Message {
    /// Check the fields required by this message's type.
    ///
    /// Returns `Ok(None)` for an unknown type: there is nothing to do and
    /// nothing to reject.
    pub fn command(&self) -> Result<Option<DeviceCommand<'_>>, HandlerError> {
        let mut missing = Vec::new();

        let command = match self.kind {
            MessageType::Unknown => return Ok(None),
            MessageType::Heartbeat => {
                let content = required(&self.content, "message", &mut missing);
                let address = required(&self.target_address, "IPAddress", &mut missing);
                ensure_present(&missing)?;
                DeviceCommand::Heartbeat {
                    content,
                    address: parse_address(address)?,
                }
            }
            MessageType::Job => {
                let file_name = required(&self.file_name, "filename", &mut missing);
                let blob_key = required(&self.blob_key, "s3name", &mut missing);
                let material = required(&self.material, "material", &mut missing);
                let address = required(&self.target_address, "IPAddress", &mut missing);
                ensure_present(&missing)?;
                DeviceCommand::Job {
                    file_name,
                    blob_key,
                    material,
                    address: parse_address(address)?,
                }
            }
            MessageType::Upload => {
                let address = required(&self.target_address, "IPAddress", &mut missing);
                let upload_info = required(&self.upload_info, "UploadInfo", &mut missing);
                let upload_url = required(&self.upload_url, "UploadURL", &mut missing);
                if self.device_name.is_empty() {
                    missing.push("DeviceName");
                }
                ensure_present(&missing)?;
                let resource = UploadResource::parse(upload_info).ok_or_else(|| {
                    HandlerError::Validation(format!(
                        "unsupported UploadInfo '{upload_info}', expected Jobs or Identification"
                    ))
                })?;
                DeviceCommand::Upload {
                    address: parse_address(address)?,
                    resource,
                    upload_url,
                    device_name: &self.device_name,
                }
            }
        };

        Ok(Some(command))
    }

    /// Type-specific summary kept in the dead-letter record.
    pub fn additional_info(&self) -> &str {
        let field = match self.kind {
            MessageType::Heartbeat => &self.content,
            MessageType::Job => &self.file_name,
            MessageType::Upload => &self.upload_info,
            MessageType::Unknown => return "",
        };
        field.as_deref().unwrap_or_default()
    }

    /// Callback base URL, if the origin asked for outcome reports.
    pub fn result_url(&self) -> Option<&str> {
        non_empty(&self.result_url)
    }

    /// Short identifier for log lines.
    pub fn log_id(&self) -> &str {
        non_empty(&self.message_uuid).unwrap_or("-")
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

fn required<'a>(
    field: &'a Option<String>,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> &'a str {
    non_empty(field).unwrap_or_else(|| {
        missing.push(name);
        ""
    })
}

fn ensure_present(missing: &[&'static str]) -> Result<(), HandlerError> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HandlerError::Validation(format!(
            "some message's expected fields are missing: {}",
            missing.join(", ")
        )))
    }
}

fn parse_address(raw: &str) -> Result<IpAddr, HandlerError> {
    raw.trim()
        .parse()
        .map_err(|_| HandlerError::Validation(format!("invalid device IP address '{raw}'")))
}
