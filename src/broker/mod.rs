//! MQTT broker client

pub mod client;
pub mod connection;

pub use client::{BrokerClient, Statistics};
pub use connection::{backoff_delay, configure_mqtt_options, ConnectionState};

use crate::error::BrokerResult;

/// Object-safe surface of the broker client, implemented by the real
/// [`BrokerClient`] and by [`crate::testing::mocks::MockBrokerClient`] so the
/// Gateway Core can be exercised against either without a live broker.
#[async_trait::async_trait]
pub trait BrokerLike: Send + Sync {
    async fn connect(&self) -> BrokerResult<()>;
    async fn disconnect(&self) -> BrokerResult<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> BrokerResult<()>;
    async fn reconnect(&self) -> BrokerResult<()>;
    async fn is_connected(&self) -> bool;
    async fn state(&self) -> ConnectionState;
    async fn stats(&self) -> Statistics;
}

#[async_trait::async_trait]
impl BrokerLike for BrokerClient {
    async fn connect(&self) -> BrokerResult<()> {
        BrokerClient::connect(self).await
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        BrokerClient::disconnect(self).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> BrokerResult<()> {
        BrokerClient::publish(self, topic, payload, qos, retain).await
    }

    async fn reconnect(&self) -> BrokerResult<()> {
        BrokerClient::reconnect(self).await
    }

    async fn is_connected(&self) -> bool {
        BrokerClient::is_connected(self).await
    }

    async fn state(&self) -> ConnectionState {
        BrokerClient::state(self).await
    }

    async fn stats(&self) -> Statistics {
        BrokerClient::stats(self).await
    }
}
