//! Health snapshot shape
//!
//! A plain serializable record built on demand from the Gateway Core's
//! component snapshots - never mutated directly, never the thing mutexes
//! guard. [`crate::gateway::GatewayCore::health_status`] is the only
//! producer; [`crate::observability::health`] is the only HTTP consumer.

use crate::broker::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub max_messages_per_second: u32,
    pub burst_capacity: f64,
    pub current_tokens: f64,
    pub messages_allowed: u64,
    pub messages_delayed: u64,
    pub total_wait_time: f64,
    pub max_wait_time: f64,
    pub avg_wait_time: f64,
}

impl From<crate::rate_limiter::RateLimiterStats> for RateLimitSnapshot {
    fn from(stats: crate::rate_limiter::RateLimiterStats) -> Self {
        Self {
            max_messages_per_second: stats.max_messages_per_second,
            burst_capacity: stats.burst_capacity,
            current_tokens: stats.current_tokens,
            messages_allowed: stats.messages_allowed,
            messages_delayed: stats.messages_delayed,
            total_wait_time: stats.total_wait_time.as_secs_f64(),
            max_wait_time: stats.max_wait_time.as_secs_f64(),
            avg_wait_time: stats.avg_wait_time().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub enabled: bool,
    pub initialized: bool,
    pub connected: bool,
    pub connection_count: u64,
    pub disconnection_count: u64,
    pub reconnection_count: u64,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_disconnect_time: Option<DateTime<Utc>>,
    pub messages_received: u64,
    pub messages_published: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub last_publish_time: Option<DateTime<Utc>>,
    pub publish_errors: u64,
    pub mqtt_publish_errors: u64,
    pub queue_size: usize,
    pub queue_max_size: usize,
    pub queue_utilization_percent: f64,
    pub rate_limit: RateLimitSnapshot,
}

/// Round to two decimal places.
pub fn queue_utilization_percent(size: usize, max_size: usize) -> f64 {
    if max_size == 0 {
        return 0.0;
    }
    let raw = (size as f64 / max_size as f64) * 100.0;
    (raw * 100.0).round() / 100.0
}

/// `healthy = enabled ∧ initialized ∧ connected`.
pub fn is_healthy(enabled: bool, initialized: bool, state: ConnectionState) -> bool {
    enabled && initialized && state == ConnectionState::Connected
}
