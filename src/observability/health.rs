//! Loopback HTTP health endpoint
//!
//! Serves the same [`crate::health::HealthSnapshot`] returned by
//! [`crate::gateway::GatewayCore::health_status`] as JSON on `GET /health`,
//! bound to a configurable port, started as a background task alongside the
//! gateway.

use crate::gateway::GatewayCore;
use std::convert::Infallible;
use std::sync::Arc;
use warp::Filter;

const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Minimal loopback health server: one route, `GET /health`, returning the
/// gateway's current [`crate::health::HealthSnapshot`] as JSON.
pub struct HealthServer {
    gateway: Arc<GatewayCore>,
    port: u16,
}

impl HealthServer {
    pub fn new(gateway: Arc<GatewayCore>, port: u16) -> Self {
        Self { gateway, port }
    }

    /// Read the port from the `HEALTH_PORT` environment variable, falling
    /// back to 8080 when absent or unparsable.
    pub fn from_env(gateway: Arc<GatewayCore>) -> Self {
        let port = std::env::var("HEALTH_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_HEALTH_PORT);
        Self::new(gateway, port)
    }

    /// Bind and serve `GET /health` until the process exits. Runs forever;
    /// the caller spawns this as a background task.
    pub async fn start(self: Arc<Self>) {
        let server = self.clone();
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = server.clone();
            async move {
                let snapshot = server.gateway.health_status().await;
                let status = if snapshot.healthy {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&snapshot),
                    status,
                ))
            }
        });

        warp::serve(health_route).run(([127, 0, 0, 1], self.port)).await;
    }
}
