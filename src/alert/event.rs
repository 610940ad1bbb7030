use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const UNKNOWN_TIME: &str = "unknown time";
pub const UNKNOWN_LOCATION: &str = "unknown location";

/// Alert payload shared by the edge publisher and the monitor
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone)]
pub struct AlertEvent {
    pub status: AlertStatus,
    pub timestamp: String,
    pub location: String,
}

impl AlertEvent {
    pub fn intrusion(at: DateTime<Local>, location: impl Into<String>) -> Self {
        Self {
            status: AlertStatus::Intrusion,
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            location: location.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone)]
#[serde(from = "String", into = "String")]
pub enum AlertStatus {
    Intrusion,
    /// Anything else is carried through untouched so newer publishers can add statuses
    Other(OtherStatus),
}

/// A status string other than `INTRUSION`. Only built through `AlertStatus::from`, so an
/// intrusion can't hide in here.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OtherStatus(String);

impl AlertStatus {
    /// Returns `true` if the status is [`Intrusion`].
    ///
    /// [`Intrusion`]: AlertStatus::Intrusion
    pub fn is_intrusion(&self) -> bool {
        matches!(self, Self::Intrusion)
    }
}

impl From<String> for AlertStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "INTRUSION" => AlertStatus::Intrusion,
            _ => AlertStatus::Other(OtherStatus(s)),
        }
    }
}

impl From<AlertStatus> for String {
    fn from(s: AlertStatus) -> Self {
        s.to_string()
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Intrusion => write!(f, "INTRUSION"),
            AlertStatus::Other(OtherStatus(s)) => write!(f, "{}", s),
        }
    }
}

/// Lenient view of an inbound payload. Only `status` is mandatory.
#[derive(Deserialize)]
struct WireAlert {
    status: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

pub fn encode(event: &AlertEvent) -> Vec<u8> {
    // Serializing a struct of plain strings can't fail
    serde_json::to_vec(event).unwrap_or_default()
}

pub fn decode(payload: &[u8]) -> Result<AlertEvent, DecodeError> {
    // Only a JSON object is an alert, never a bare array or scalar
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(payload)?;
    let wire: WireAlert = serde_json::from_value(serde_json::Value::Object(object))?;
    let status = wire.status.ok_or(DecodeError::StatusMissing)?;
    Ok(AlertEvent {
        status: status.into(),
        timestamp: wire.timestamp.unwrap_or_else(|| UNKNOWN_TIME.to_string()),
        location: wire.location.unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
    })
}

quick_error! {
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
    pub enum DecodeError {
        Json(error: String) {
            display("Payload is not a valid alert object: {}", error)
            from(e: serde_json::Error) -> (e.to_string())
        }
        StatusMissing {
            display("Payload has no status field")
        }
    }
}
