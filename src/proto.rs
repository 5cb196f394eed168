//! Hand-maintained subset of the public Meshtastic protobuf schema
//!
//! This is not a `prost-build`-generated bundle of the full `meshtastic.proto`
//! family - the gateway only ever constructs three messages
//! (`ServiceEnvelope`, `MeshPacket`, `Data`) and a `PortNum` enum, so those
//! are declared directly with `prost::Message`/`prost::Oneof` derives and the
//! wire field numbers from the public schema, the same approach taken by
//! other Meshtastic-adjacent Rust projects that don't want a protoc build
//! step for a handful of fields.

use prost::{Enumeration, Message, Oneof};

/// Meshtastic application port number (subset relevant to this gateway's
/// message-type enumeration, plus a few extras from the public schema that
/// round out the allowed-tags list in the wire spec).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    DetectionSensorApp = 10,
    ReplyApp = 32,
    IpTunnelApp = 33,
    PaxcounterApp = 34,
    SerialApp = 64,
    StoreForwardApp = 65,
    RangeTestApp = 66,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    AtakPlugin = 72,
    PrivateApp = 256,
}

#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Oneof)]
pub enum PayloadVariant {
    #[prost(message, tag = "4")]
    Decoded(Data),
    #[prost(bytes, tag = "5")]
    Encrypted(Vec<u8>),
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(uint32, tag = "1")]
    pub from: u32,
    #[prost(uint32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<PayloadVariant>,
    #[prost(uint32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_envelope_round_trips_through_the_wire() {
        let envelope = ServiceEnvelope {
            packet: Some(MeshPacket {
                from: 0xa1b2c3d4,
                to: 0xFFFFFFFF,
                channel: 0,
                payload_variant: Some(PayloadVariant::Decoded(Data {
                    portnum: PortNum::TextMessageApp as i32,
                    payload: b"hi".to_vec(),
                })),
                id: 42,
                rx_time: 1_700_000_000,
                rx_snr: 5.5,
                hop_limit: 3,
                rx_rssi: -80,
                hop_start: 3,
            }),
            channel_id: "0".to_string(),
            gateway_id: "zephyrgate".to_string(),
        };

        let bytes = envelope.encode_to_vec();
        let decoded = ServiceEnvelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn encrypted_variant_excludes_decoded_field() {
        let packet = MeshPacket {
            from: 1,
            to: 2,
            channel: 0,
            payload_variant: Some(PayloadVariant::Encrypted(vec![1, 2, 3])),
            id: 1,
            rx_time: 0,
            rx_snr: 0.0,
            hop_limit: 3,
            rx_rssi: 0,
            hop_start: 3,
        };
        match packet.payload_variant {
            Some(PayloadVariant::Encrypted(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("expected encrypted variant"),
        }
    }
}
