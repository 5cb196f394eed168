//! Mesh-side message types
//!
//! The gateway treats the mesh receiver as an external collaborator: it
//! hands us a [`MeshMessage`] and we are opaque to everything in it except
//! the fields named in the wire spec. `content` and `metadata` in particular
//! are carried through unexamined except for a handful of well-known keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Broadcast sentinel recipient: "no specific recipient".
pub const BROADCAST_SENTINEL: &str = "^all";

/// Meshtastic application-layer message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Text,
    Position,
    NodeInfo,
    Routing,
    Admin,
    Telemetry,
    RangeTest,
    DetectionSensor,
    Reply,
    IpTunnel,
    Serial,
    StoreForward,
    Unknown,
}

impl MessageType {
    /// Lower-case tag used in JSON payloads and channel allowlists.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Position => "position",
            MessageType::NodeInfo => "nodeinfo",
            MessageType::Routing => "routing",
            MessageType::Admin => "admin",
            MessageType::Telemetry => "telemetry",
            MessageType::RangeTest => "range_test",
            MessageType::DetectionSensor => "detection_sensor",
            MessageType::Reply => "reply",
            MessageType::IpTunnel => "ip_tunnel",
            MessageType::Serial => "serial",
            MessageType::StoreForward => "store_forward",
            MessageType::Unknown => "unknown",
        }
    }

    /// Case-insensitive match against one of the allowed message-type tags
    /// from a channel's `message_types` allowlist.
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tag().eq_ignore_ascii_case(tag)
    }
}

/// Delivery priority. Ordered `Emergency > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Emergency = 4,
}

/// Arbitrary metadata value carried alongside a message. Only a handful of
/// keys are given meaning by the gateway (`encrypted_payload`, `gateway_id`,
/// `hop_count`); everything else passes through unexamined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bytes(Vec<u8>),
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl MetadataValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Mesh message content: either text or raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Bytes(Vec<u8>),
    Empty,
}

impl Content {
    pub fn is_empty(&self) -> bool {
        matches!(self, Content::Empty)
    }
}

/// A message received from the mesh radio network, opaque to the gateway
/// except for the fields below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub channel: u32,
    pub message_type: MessageType,
    pub content: Content,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub hop_limit: Option<u32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub priority: Priority,
    #[serde(default)]
    pub metadata: HashMap<String, MetadataValue>,
}

impl MeshMessage {
    /// True when `recipient_id` is present and is not the broadcast sentinel.
    pub fn has_specific_recipient(&self) -> bool {
        match &self.recipient_id {
            Some(r) => r != BROADCAST_SENTINEL,
            None => false,
        }
    }

    pub fn gateway_id(&self) -> Option<&str> {
        self.metadata.get("gateway_id").and_then(|v| v.as_str())
    }

    pub fn hop_count(&self) -> Option<i64> {
        self.metadata.get("hop_count").and_then(|v| v.as_i64())
    }

    pub fn encrypted_payload(&self) -> Option<&[u8]> {
        self.metadata
            .get("encrypted_payload")
            .and_then(|v| v.as_bytes())
    }
}

/// Convenience constructor used by tests and the CLI injection utility.
pub fn unix_now() -> chrono::DateTime<chrono::Utc> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
}
