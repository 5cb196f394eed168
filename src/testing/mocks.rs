//! Mock broker client for exercising the Gateway Core without a live broker
//!
//! A `should_fail` knob, `Arc<Mutex<..>>`-backed history the test can inspect
//! after the fact, and a trait implementation with the exact async signature
//! of the real thing.

use crate::broker::{BrokerLike, ConnectionState, Statistics};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>, u8, bool);

#[derive(Default)]
pub struct MockBrokerClient {
    connected: AtomicBool,
    pub should_fail_publish: AtomicBool,
    pub should_fail_connect: AtomicBool,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    connect_calls: AtomicU64,
    publish_errors: AtomicU64,
    messages_published: AtomicU64,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start already connected, as in S1/S2's "mocked as always Connected".
    pub fn connected() -> Self {
        let mock = Self::new();
        mock.connected.store(true, Ordering::Relaxed);
        mock
    }

    pub fn with_publish_failures() -> Self {
        let mock = Self::new();
        mock.should_fail_publish.store(true, Ordering::Relaxed);
        mock
    }

    pub async fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

#[async_trait]
impl BrokerLike for MockBrokerClient {
    async fn connect(&self) -> BrokerResult<()> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail_connect.load(Ordering::Relaxed) {
            return Err(BrokerError::ConnectFailed("mock configured to fail".to_string()));
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> BrokerResult<()> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidPublishArgs("topic is empty".to_string()));
        }
        if !self.connected.load(Ordering::Relaxed) {
            return Err(BrokerError::NotConnected(ConnectionState::Disconnected));
        }
        if self.should_fail_publish.load(Ordering::Relaxed) {
            self.publish_errors.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::PublishFailed("mock configured to fail".to_string()));
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload, qos, retain));
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reconnect(&self) -> BrokerResult<()> {
        self.connect().await
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Relaxed) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn stats(&self) -> Statistics {
        Statistics {
            connection_count: self.connect_calls.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            mqtt_publish_errors: self.publish_errors.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_requires_connected() {
        let mock = MockBrokerClient::new();
        let err = mock
            .publish("t", b"x".to_vec(), 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(_)));
    }

    #[tokio::test]
    async fn connected_constructor_starts_connected() {
        let mock = MockBrokerClient::connected();
        assert!(mock.is_connected().await);
        mock.publish("t", b"x".to_vec(), 0, false).await.unwrap();
        assert_eq!(mock.published_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_mode_counts_errors() {
        let mock = MockBrokerClient::with_publish_failures();
        mock.set_connected(true);
        assert!(mock.publish("t", b"x".to_vec(), 0, false).await.is_err());
        assert_eq!(mock.stats().await.publish_errors, 1);
    }
}
