//! Ambient observability stack: structured logging and the loopback health
//! HTTP surface. Neither is part of the gateway's uplink pipeline.

pub mod health;
pub mod logging;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
