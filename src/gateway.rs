//! Gateway Core
//!
//! Wires the other components together: validated [`Settings`], [`RateLimiter`],
//! [`PriorityQueue`], [`formatter`] and a [`BrokerLike`] client. Owns the
//! ingestion path (`handle`) and the background drainer task. The only
//! component whose failure is surfaced to the host framework is
//! configuration validation; everything downstream of that is counted,
//! not raised.

use crate::broker::{BrokerClient, BrokerLike};
use crate::config::{validate, RawConfig, Settings};
use crate::error::GatewayResult;
use crate::formatter;
use crate::health::{is_healthy, queue_utilization_percent, HealthSnapshot};
use crate::mesh::MeshMessage;
use crate::queue::{PriorityQueue, QueuedItem};
use crate::rate_limiter::RateLimiter;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DRAINER_TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// Log a successful publish at info level when `log_published_messages` is
/// set, else at debug level (§4.1).
fn log_publish(settings: &Settings, topic: &str) {
    if settings.log_published_messages {
        info!(topic, "published message to broker");
    } else {
        debug!(topic, "published message to broker");
    }
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    messages_published: AtomicU64,
    messages_queued: AtomicU64,
    messages_dropped: AtomicU64,
    publish_errors: AtomicU64,
}

/// Gateway Core: the uni-directional mesh-to-MQTT bridge.
pub struct GatewayCore {
    settings: Arc<Settings>,
    queue: Arc<PriorityQueue>,
    rate_limiter: Arc<RateLimiter>,
    broker: Arc<dyn BrokerLike>,
    initialized: AtomicBool,
    counters: Arc<Counters>,
    last_publish_time: Arc<Mutex<Option<chrono::DateTime<Utc>>>>,
    drainer: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

/// Validate `raw` and construct a [`GatewayCore`] backed by a real
/// [`BrokerClient`]. The only fallible step in the lifecycle.
pub fn initialize(raw: &RawConfig) -> GatewayResult<GatewayCore> {
    let settings = validate(raw)?;
    let settings = Arc::new(settings);
    let broker = Arc::new(BrokerClient::new(settings.clone()));
    Ok(GatewayCore::with_broker(settings, broker))
}

impl GatewayCore {
    /// Construct with an explicit broker implementation, for tests that
    /// substitute [`crate::testing::mocks::MockBrokerClient`].
    pub fn with_broker(settings: Arc<Settings>, broker: Arc<dyn BrokerLike>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            settings.max_messages_per_second,
            settings.burst_multiplier,
        ));
        let queue = Arc::new(PriorityQueue::new(settings.queue_max_size));
        Self {
            settings,
            queue,
            rate_limiter,
            broker,
            initialized: AtomicBool::new(true),
            counters: Arc::new(Counters::default()),
            last_publish_time: Arc::new(Mutex::new(None)),
            drainer: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Connect to the broker and start the drainer task. If the initial
    /// connect fails, still spawn the drainer (it no-ops while disconnected)
    /// and kick off a background reconnect loop.
    pub async fn start(&self) -> GatewayResult<()> {
        if !self.settings.enabled {
            info!("gateway disabled by configuration, start() is a no-op");
            return Ok(());
        }

        if self.broker.connect().await.is_err() {
            warn!("initial connect failed, spawning background reconnect");
            let broker = self.broker.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.reconnect().await {
                    error!(error = %e, "background reconnect gave up");
                }
            });
        }

        self.spawn_drainer().await;
        Ok(())
    }

    async fn spawn_drainer(&self) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let settings = self.settings.clone();
        let queue = self.queue.clone();
        let rate_limiter = self.rate_limiter.clone();
        let broker = self.broker.clone();
        let counters = self.counters.clone();
        let last_publish_time = self.last_publish_time.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAINER_TICK);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !broker.is_connected().await {
                            continue;
                        }
                        let Some(mut item) = queue.dequeue() else {
                            continue;
                        };
                        let _ = rate_limiter.acquire().await;
                        match broker
                            .publish(&item.topic, item.payload.clone(), item.qos, false)
                            .await
                        {
                            Ok(()) => {
                                log_publish(&settings, &item.topic);
                                counters.messages_published.fetch_add(1, Ordering::Relaxed);
                                *last_publish_time.lock().await = Some(Utc::now());
                            }
                            Err(e) => {
                                counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                                item.retries += 1;
                                if item.retries < item.max_retries {
                                    warn!(error = %e, retries = item.retries, "publish failed, re-enqueuing");
                                    let _ = queue.enqueue(item);
                                } else {
                                    error!(error = %e, "publish failed after max retries, dropping");
                                    counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                }
            }
        });

        *self.drainer.lock().await = Some((handle, shutdown_tx));
    }

    /// Cancel the drainer, disconnect the broker, and clear the queue.
    /// Idempotent (L1 extends to the gateway's own stop semantics).
    pub async fn stop(&self) -> GatewayResult<()> {
        if let Some((handle, shutdown_tx)) = self.drainer.lock().await.take() {
            let _ = shutdown_tx.send(true);
            handle.abort();
        }
        self.broker.disconnect().await?;
        self.queue.clear();
        Ok(())
    }

    /// Ingestion entry point for mesh-received messages. Returns immediately;
    /// publication happens on a spawned task.
    pub async fn handle(&self, message: MeshMessage) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        if !self.settings.enabled || !self.initialized.load(Ordering::Relaxed) {
            return;
        }

        if !formatter::is_forwardable(&self.settings, &message) {
            return;
        }

        let settings = self.settings.clone();
        let rate_limiter = self.rate_limiter.clone();
        let queue = self.queue.clone();
        let broker = self.broker.clone();
        let counters = self.counters.clone();
        let last_publish_time = self.last_publish_time.clone();

        tokio::spawn(async move {
            publish_one(
                settings,
                rate_limiter,
                queue,
                broker,
                counters,
                last_publish_time,
                message,
            )
            .await;
        });
    }

    pub async fn health_status(&self) -> HealthSnapshot {
        let broker_stats = self.broker.stats().await;
        let connected = self.broker.is_connected().await;
        let state = self.broker.state().await;
        let rate_stats = self.rate_limiter.stats().await;
        let queue_size = self.queue.size();
        let queue_max_size = self.queue.max_size();

        HealthSnapshot {
            healthy: is_healthy(self.settings.enabled, self.initialized.load(Ordering::Relaxed), state),
            enabled: self.settings.enabled,
            initialized: self.initialized.load(Ordering::Relaxed),
            connected,
            connection_count: broker_stats.connection_count,
            disconnection_count: broker_stats.disconnection_count,
            reconnection_count: broker_stats.reconnection_count,
            last_connect_time: broker_stats.last_connect_time,
            last_disconnect_time: broker_stats.last_disconnect_time,
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            messages_published: self.counters.messages_published.load(Ordering::Relaxed),
            messages_queued: self.counters.messages_queued.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
            last_publish_time: *self.last_publish_time.lock().await,
            publish_errors: self.counters.publish_errors.load(Ordering::Relaxed),
            mqtt_publish_errors: broker_stats.mqtt_publish_errors,
            queue_size,
            queue_max_size,
            queue_utilization_percent: queue_utilization_percent(queue_size, queue_max_size),
            rate_limit: rate_stats.into(),
        }
    }
}

/// Publication task body: filter, format, rate-limit, then publish or
/// enqueue. Free function so it can run detached from `&self` inside a
/// spawned task.
async fn publish_one(
    settings: Arc<Settings>,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<PriorityQueue>,
    broker: Arc<dyn BrokerLike>,
    counters: Arc<Counters>,
    last_publish_time: Arc<Mutex<Option<chrono::DateTime<Utc>>>>,
    message: MeshMessage,
) {
    let topic = formatter::topic(&settings, &message);
    let payload = match formatter::payload(&settings, &message) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, message_id = %message.id, "formatting failed, message dropped");
            counters.publish_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if let Err(e) = rate_limiter.acquire().await {
        error!(error = %e, "rate limiter error, admitting message anyway (fail-open)");
    }

    let priority = message.priority;
    let item = QueuedItem::new(message, topic, payload, 0);

    if broker.is_connected().await {
        match broker.publish(&item.topic, item.payload.clone(), item.qos, false).await {
            Ok(()) => {
                log_publish(&settings, &item.topic);
                counters.messages_published.fetch_add(1, Ordering::Relaxed);
                *last_publish_time.lock().await = Some(Utc::now());
            }
            Err(e) => {
                warn!(error = %e, ?priority, "publish failed, re-enqueuing for drainer retry");
                if queue.enqueue(item).is_err() {
                    counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    error!("queue full and nothing could be dropped, message lost");
                } else {
                    counters.messages_queued.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    } else if queue.enqueue(item).is_err() {
        counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
        error!("broker disconnected and queue full, message lost");
    } else {
        counters.messages_queued.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, RawConfig};
    use crate::mesh::{unix_now, Content, MessageType, Priority};
    use crate::testing::mocks::MockBrokerClient;
    use std::collections::HashMap;

    fn settings_enabled() -> Arc<Settings> {
        let mut raw = RawConfig::new();
        raw.insert("enabled".to_string(), toml::Value::Boolean(true));
        Arc::new(validate(&raw).unwrap())
    }

    fn message(channel: u32, message_type: MessageType) -> MeshMessage {
        MeshMessage {
            id: "1".to_string(),
            sender_id: "!a1b2c3d4".to_string(),
            recipient_id: None,
            channel,
            message_type,
            content: Content::Text("hi".to_string()),
            timestamp: unix_now(),
            hop_limit: None,
            snr: None,
            rssi: None,
            priority: Priority::Normal,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn s1_connected_broker_publishes_immediately() {
        let settings = settings_enabled();
        let broker = Arc::new(MockBrokerClient::connected());
        let gateway = GatewayCore::with_broker(settings, broker.clone());

        gateway.handle(message(0, MessageType::Text)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let published = broker.published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "msh/US/2/json/0/!a1b2c3d4");
    }

    #[tokio::test]
    async fn s3_broker_down_enqueues_without_publishing() {
        let settings = settings_enabled();
        let broker = Arc::new(MockBrokerClient::new());
        let gateway = GatewayCore::with_broker(settings, broker.clone());

        for _ in 0..5 {
            gateway.handle(message(0, MessageType::Text)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(gateway.queue.size(), 5);
        assert!(broker.published_messages().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_gateway_drops_messages_silently() {
        let settings = Arc::new(validate(&RawConfig::new()).unwrap());
        assert!(!settings.enabled);
        let broker = Arc::new(MockBrokerClient::connected());
        let gateway = GatewayCore::with_broker(settings, broker.clone());

        gateway.handle(message(0, MessageType::Text)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(broker.published_messages().await.is_empty());
    }
}
