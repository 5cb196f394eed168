//! meshgate - a uni-directional Meshtastic mesh-to-MQTT gateway
//!
//! Bridges messages received from a low-power mesh radio network to a
//! conventional MQTT broker using the Meshtastic MQTT wire conventions, so
//! downstream consumers (dashboards, logging, analytics) can subscribe to
//! mesh traffic without speaking the mesh protocol themselves.
//!
//! This crate implements only the uplink (mesh -> MQTT) pipeline: a
//! configuration validator ([`config`]), a token-bucket rate limiter
//! ([`rate_limiter`]), a bounded priority queue ([`queue`]), a topic/payload
//! formatter ([`formatter`], backed by the hand-maintained protobuf subset in
//! [`proto`]), an MQTT broker client with reconnection ([`broker`]), and the
//! [`gateway`] core that wires them together. The mesh-side receiver, the
//! email gateway, the emergency-response subsystem, and any downlink
//! direction are outside this crate's scope.

pub mod broker;
pub mod config;
pub mod error;
pub mod formatter;
pub mod gateway;
pub mod health;
pub mod mesh;
pub mod observability;
pub mod proto;
pub mod queue;
pub mod rate_limiter;
pub mod testing;

pub use config::Settings;
pub use error::{GatewayError, GatewayResult};
pub use gateway::GatewayCore;
pub use health::HealthSnapshot;
pub use mesh::MeshMessage;
