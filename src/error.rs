//! Error types for the mesh-to-MQTT gateway
//!
//! One `thiserror`-derived enum per module boundary, following this
//! organization's convention of narrow, locally-meaningful error enums
//! rather than a single crate-wide type. [`GatewayError`] aggregates the
//! others via `#[from]` at the one boundary that needs to talk about all of
//! them at once: the Gateway Core.

use thiserror::Error;

/// Errors raised by the configuration validator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("field '{field}': expected {expected}, got {observed}")]
    InvalidType {
        field: String,
        expected: String,
        observed: String,
    },

    #[error("field '{field}': value {observed} out of range ({constraint})")]
    OutOfRange {
        field: String,
        observed: String,
        constraint: String,
    },

    #[error("field '{field}': '{observed}' is not one of the allowed values {allowed}")]
    InvalidEnum {
        field: String,
        observed: String,
        allowed: String,
    },

    #[error("field '{field}': {reason}")]
    CrossFieldConstraint { field: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised by the message formatter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    #[error("sender_id is empty, message rejected")]
    EmptySenderId,

    #[error("channel value cannot be represented: {0}")]
    UncoercibleChannel(String),

    #[error("failed to serialize payload: {0}")]
    Serialization(String),
}

pub type FormatResult<T> = Result<T, FormatError>;

/// Errors raised by the MQTT broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("authentication rejected by broker: {0}")]
    AuthenticationFailed(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("not connected, current state: {0:?}")]
    NotConnected(crate::broker::ConnectionState),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("invalid publish arguments: {0}")]
    InvalidPublishArgs(String),

    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the rate limiter. These are fail-open: the caller is
/// never blocked forever and the message is admitted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimiterError {
    #[error("non-monotonic clock detected, bucket reset")]
    NonMonotonicClock,
}

/// Errors surfaced by the priority queue.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error("queue is full and nothing could be dropped to make room")]
    Overflow,
}

/// Aggregate error type for the Gateway Core, the only component that
/// needs to talk about failures from every other component at once.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration invalid: {0}")]
    Config(#[from] ConfigError),

    #[error("formatting failed: {0}")]
    Format(#[from] FormatError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("gateway not initialized")]
    NotInitialized,
}

pub type GatewayResult<T> = Result<T, GatewayError>;
