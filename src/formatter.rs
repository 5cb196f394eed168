//! Topic and payload formatting
//!
//! Pure functions: given a [`Settings`] and a [`MeshMessage`], produce the
//! MQTT topic string and serialized payload bytes. Nothing here touches the
//! network or the queue - a formatting failure simply means the message is
//! never queued.

use crate::config::Settings;
use crate::error::{FormatError, FormatResult};
use crate::mesh::{Content, MeshMessage, MessageType};
use crate::proto::{self, PortNum};
use prost::Message as _;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const TOPIC_VERSION: &str = "2";
const DEFAULT_GATEWAY_ID: &str = "zephyrgate";

/// Whether `message` is eligible for uplink on the channel it arrived on.
/// Invoked by the Gateway Core before formatting; the formatter itself
/// otherwise does not consult channel policy.
pub fn is_forwardable(settings: &Settings, message: &MeshMessage) -> bool {
    settings
        .channel_policy(message.channel)
        .allows(message.message_type.tag())
}

/// Build the MQTT topic string for `message`.
pub fn topic(settings: &Settings, message: &MeshMessage) -> String {
    let kind = if settings.encryption_enabled {
        "e"
    } else {
        "json"
    };
    format!(
        "{root}/{version}/{kind}/{channel}/{sender}",
        root = settings.root_topic,
        version = TOPIC_VERSION,
        kind = kind,
        channel = message.channel,
        sender = message.sender_id,
    )
}

/// Build the serialized payload for `message` according to `settings.format`.
pub fn payload(settings: &Settings, message: &MeshMessage) -> FormatResult<Vec<u8>> {
    if message.sender_id.trim().is_empty() {
        return Err(FormatError::EmptySenderId);
    }

    match settings.format {
        crate::config::PayloadFormat::Json => json_payload(settings, message),
        crate::config::PayloadFormat::Protobuf => protobuf_payload(settings, message),
    }
}

fn portnum_for(message_type: MessageType) -> PortNum {
    match message_type {
        MessageType::Text => PortNum::TextMessageApp,
        MessageType::Position => PortNum::PositionApp,
        MessageType::NodeInfo => PortNum::NodeinfoApp,
        MessageType::Routing => PortNum::RoutingApp,
        MessageType::Admin => PortNum::AdminApp,
        MessageType::Telemetry => PortNum::TelemetryApp,
        MessageType::RangeTest => PortNum::RangeTestApp,
        MessageType::DetectionSensor => PortNum::DetectionSensorApp,
        MessageType::Reply => PortNum::ReplyApp,
        MessageType::IpTunnel => PortNum::IpTunnelApp,
        MessageType::Serial => PortNum::SerialApp,
        MessageType::StoreForward => PortNum::StoreForwardApp,
        MessageType::Unknown => PortNum::UnknownApp,
    }
}

/// Parse a Meshtastic node id of the form `!a1b2c3d4` into its numeric form.
/// Falls back to 0 on any parse failure.
fn parse_node_id(id: &str) -> u32 {
    let hex = id.strip_prefix('!').unwrap_or(id);
    u32::from_str_radix(hex, 16).unwrap_or(0)
}

fn resolve_to(message: &MeshMessage) -> u32 {
    match &message.recipient_id {
        Some(r) if r != crate::mesh::BROADCAST_SENTINEL => parse_node_id(r),
        _ => 0xFFFFFFFF,
    }
}

/// Stable 32-bit reduction of `MeshMessage.id`, used as MeshPacket.id.
fn packet_id(id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() & 0xFFFF_FFFF) as u32
}

fn content_bytes(content: &Content) -> Vec<u8> {
    match content {
        Content::Text(s) => s.as_bytes().to_vec(),
        Content::Bytes(b) => b.clone(),
        Content::Empty => Vec::new(),
    }
}

fn protobuf_payload(settings: &Settings, message: &MeshMessage) -> FormatResult<Vec<u8>> {
    let hop_limit = message.hop_limit.unwrap_or(3);

    let payload_variant = if settings.encryption_enabled {
        let bytes = match message.encrypted_payload() {
            Some(b) => b.to_vec(),
            None => {
                if message.metadata.contains_key("encrypted_payload") {
                    tracing::warn!(
                        message_id = %message.id,
                        "encrypted_payload metadata present but not bytes-typed, using empty payload"
                    );
                }
                Vec::new()
            }
        };
        proto::PayloadVariant::Encrypted(bytes)
    } else {
        proto::PayloadVariant::Decoded(proto::Data {
            portnum: portnum_for(message.message_type) as i32,
            payload: content_bytes(&message.content),
        })
    };

    let packet = proto::MeshPacket {
        from: parse_node_id(&message.sender_id),
        to: resolve_to(message),
        channel: message.channel,
        payload_variant: Some(payload_variant),
        id: packet_id(&message.id),
        rx_time: message.timestamp.timestamp().max(0) as u32,
        rx_snr: message.snr.unwrap_or(0.0),
        hop_limit,
        rx_rssi: message.rssi.unwrap_or(0),
        hop_start: hop_limit,
    };

    let envelope = proto::ServiceEnvelope {
        packet: Some(packet),
        channel_id: message.channel.to_string(),
        gateway_id: message
            .gateway_id()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_GATEWAY_ID.to_string()),
    };

    Ok(envelope.encode_to_vec())
}

/// JSON payload shape. Fields are only emitted when present on the
/// source message; `#[serde(skip_serializing_if)]` mirrors that optionality.
#[derive(Debug, Serialize)]
struct JsonPayload {
    sender: String,
    timestamp: i64,
    channel: u32,
    #[serde(rename = "type")]
    message_type: &'static str,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    snr: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hop_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hop_count: Option<i64>,
}

fn json_payload(_settings: &Settings, message: &MeshMessage) -> FormatResult<Vec<u8>> {
    let payload_text = match &message.content {
        Content::Text(s) => s.clone(),
        Content::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Content::Empty => String::new(),
    };

    let to = if message.has_specific_recipient() {
        message.recipient_id.clone()
    } else {
        None
    };

    let doc = JsonPayload {
        sender: message.sender_id.clone(),
        timestamp: message.timestamp.timestamp(),
        channel: message.channel,
        message_type: message.message_type.tag(),
        payload: payload_text,
        snr: message.snr,
        rssi: message.rssi,
        to,
        hop_limit: message.hop_limit,
        gateway_id: message.gateway_id().map(str::to_string),
        hop_count: message.hop_count(),
    };

    serde_json::to_vec(&doc).map_err(|e| FormatError::Serialization(e.to_string()))
}
