//! Impure I/O half of the MQTT broker client
//!
//! Wraps `rumqttc`'s callback-driven event loop behind a small async surface:
//! `connect`/`disconnect`/`publish`/`reconnect`/`is_connected`/`state`/`stats`.
//! A single background task owns the `EventLoop` and posts state transitions
//! back through a `watch` channel; `state` itself lives behind a plain mutex
//! that is never held across an `.await`. The shared state lives behind an
//! `Arc` inside [`BrokerClient`] so that background task, and the reconnect
//! task it spawns on an unexpected loss, keep driving it long after the
//! initial `connect()` call has returned.

use super::connection::{backoff_delay, configure_mqtt_options, ConnectionState};
use crate::config::Settings;
use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of broker-client counters, also surfaced in the health snapshot.
/// One record owned by the client; readers only ever see a cloned copy.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub connection_count: u64,
    pub disconnection_count: u64,
    pub reconnection_count: u64,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_disconnect_time: Option<DateTime<Utc>>,
    pub messages_published: u64,
    pub publish_errors: u64,
    pub mqtt_publish_errors: u64,
}

struct Counters {
    connection_count: AtomicU64,
    disconnection_count: AtomicU64,
    reconnection_count: AtomicU64,
    messages_published: AtomicU64,
    publish_errors: AtomicU64,
    mqtt_publish_errors: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            connection_count: AtomicU64::new(0),
            disconnection_count: AtomicU64::new(0),
            reconnection_count: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            mqtt_publish_errors: AtomicU64::new(0),
        }
    }
}

struct Session {
    client: AsyncClient,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared state behind `BrokerClient`'s `Arc`. Split out from `BrokerClient`
/// itself so the background event-loop task, and the reconnect task it spawns
/// on an unexpected connection loss, can each hold a clone of the `Arc` and
/// keep driving `state`/counters/timestamps long after the original
/// `connect()` caller has moved on.
struct Inner {
    settings: Arc<Settings>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
    timestamps: Mutex<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl Inner {
    async fn set_state(&self, new_state: ConnectionState) {
        *self.state.lock().await = new_state;
    }

    async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Detects an unexpected loss (the state was `Connected` when the
    /// background event-loop task observed a disconnect or poll error) and,
    /// if so, transitions to `Disconnected`, retires the now-dead session,
    /// and - when `reconnect_enabled` - spawns a `Reconnecting` task.
    ///
    /// Returns `true` when this was a genuine post-connect loss, telling the
    /// caller (the event-loop task) to stop polling: a fresh session is on
    /// its way via the spawned reconnect rather than this one.
    async fn note_unexpected_loss(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().await;
            if *state != ConnectionState::Connected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }

        self.session.lock().await.take();
        self.counters.disconnection_count.fetch_add(1, Ordering::Relaxed);
        self.timestamps.lock().await.1 = Some(Utc::now());
        warn!("unexpected MQTT disconnect");

        if self.settings.reconnect_enabled {
            let inner = self.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = inner.reconnect().await {
                    error!(error = %e, "automatic reconnect failed");
                }
            });
            *self.reconnect_task.lock().await = Some(task);
        }
        true
    }

    /// Open a session and wait for CONNACK within the connect deadline.
    /// Idempotent: a no-op when already Connected.
    async fn connect(self: &Arc<Self>) -> BrokerResult<()> {
        if self.state().await == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting).await;

        let client_id = format!(
            "meshgate-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let options = configure_mqtt_options(&client_id, &self.settings);
        let (client, mut event_loop) = AsyncClient::new(options, 16);

        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reconnect_enabled = self.settings.reconnect_enabled;
        let auth_failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let auth_failed_writer = auth_failed.clone();
        let inner = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = event_loop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                                if ack.code == ConnectReturnCode::Success {
                                    let _ = state_tx.send(ConnectionState::Connected);
                                } else {
                                    error!(code = ?ack.code, "MQTT broker rejected connection");
                                    if matches!(
                                        ack.code,
                                        ConnectReturnCode::BadUserNamePassword
                                            | ConnectReturnCode::NotAuthorized
                                    ) {
                                        auth_failed_writer.store(true, Ordering::Relaxed);
                                    }
                                    let _ = state_tx.send(ConnectionState::Disconnected);
                                    break;
                                }
                            }
                            Ok(Event::Incoming(Packet::Disconnect)) => {
                                warn!("broker sent DISCONNECT");
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                if inner.note_unexpected_loss().await {
                                    break;
                                }
                                if !reconnect_enabled {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                debug!(error = %e, "MQTT event loop error");
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                if inner.note_unexpected_loss().await {
                                    break;
                                }
                                if !reconnect_enabled {
                                    break;
                                }
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                        }
                    }
                }
            }
        });

        let wait_for_connack = async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(BrokerError::ConnectFailed(
                        "event loop task ended before CONNACK".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => {
                        if auth_failed.load(Ordering::Relaxed) {
                            return Err(BrokerError::AuthenticationFailed(
                                "broker rejected credentials".to_string(),
                            ));
                        }
                        return Err(BrokerError::ConnectFailed(
                            "broker closed connection before CONNACK".to_string(),
                        ));
                    }
                    _ => continue,
                }
            }
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack).await {
            Ok(Ok(())) => {
                *self.session.lock().await = Some(Session {
                    client,
                    handle,
                    shutdown_tx,
                });
                self.set_state(ConnectionState::Connected).await;
                self.counters.connection_count.fetch_add(1, Ordering::Relaxed);
                self.timestamps.lock().await.0 = Some(Utc::now());
                info!(broker = %self.settings.broker_address, "connected to MQTT broker");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = shutdown_tx.send(true);
                handle.abort();
                self.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
            Err(_) => {
                let _ = shutdown_tx.send(true);
                handle.abort();
                self.set_state(ConnectionState::Disconnected).await;
                Err(BrokerError::ConnectTimeout(CONNECT_TIMEOUT))
            }
        }
    }

    /// Close the session. Safe to call when already disconnected (L1).
    /// Cancels any in-progress background reconnect first.
    async fn disconnect(&self) -> BrokerResult<()> {
        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }

        if self.state().await == ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(ConnectionState::Disconnecting).await;

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let _ = session.shutdown_tx.send(true);
            let disconnect_result =
                tokio::time::timeout(DISCONNECT_TIMEOUT, session.client.disconnect()).await;
            if disconnect_result.is_err() {
                warn!("MQTT disconnect did not complete within deadline, forcing close");
            }
            session.handle.abort();
        }

        self.set_state(ConnectionState::Disconnected).await;
        self.counters.disconnection_count.fetch_add(1, Ordering::Relaxed);
        self.timestamps.lock().await.1 = Some(Utc::now());
        Ok(())
    }

    /// Publish `payload` to `topic`. Requires Connected; validates arguments
    /// before touching the network.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> BrokerResult<()> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidPublishArgs("topic is empty".to_string()));
        }
        let qos = match qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => {
                return Err(BrokerError::InvalidPublishArgs(format!(
                    "qos {other} out of range 0..=2"
                )))
            }
        };

        let state = self.state().await;
        if state != ConnectionState::Connected {
            return Err(BrokerError::NotConnected(state));
        }

        let session_guard = self.session.lock().await;
        let Some(session) = session_guard.as_ref() else {
            return Err(BrokerError::NotConnected(state));
        };

        match session.client.publish(topic, qos, retain, payload).await {
            Ok(()) => {
                self.counters.messages_published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.mqtt_publish_errors.fetch_add(1, Ordering::Relaxed);
                Err(BrokerError::PublishFailed(e.to_string()))
            }
        }
    }

    /// Repeatedly call `connect()` with exponential backoff until it
    /// succeeds or attempts are exhausted. Returns immediately (success) if
    /// reconnection is disabled by configuration.
    async fn reconnect(self: &Arc<Self>) -> BrokerResult<()> {
        if !self.settings.reconnect_enabled {
            return Ok(());
        }

        self.set_state(ConnectionState::Reconnecting).await;
        let mut attempt: u32 = 0;
        loop {
            match self.connect().await {
                Ok(()) => {
                    self.counters.reconnection_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e @ BrokerError::AuthenticationFailed(_)) => {
                    error!(error = %e, "broker rejected credentials, suppressing automatic reconnect");
                    self.set_state(ConnectionState::Disconnected).await;
                    return Err(e);
                }
                Err(e) => {
                    if self.settings.max_reconnect_attempts >= 0
                        && attempt as i64 >= self.settings.max_reconnect_attempts
                    {
                        error!(attempts = attempt, "exhausted reconnect attempts");
                        return Err(e);
                    }
                    let delay = backoff_delay(
                        attempt,
                        self.settings.reconnect_initial_delay,
                        self.settings.reconnect_max_delay,
                        self.settings.reconnect_multiplier,
                    );
                    warn!(attempt, ?delay, error = %e, "reconnect attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// MQTT broker client. One instance per gateway; internally a thin,
/// cheaply-`Arc`-cloned handle onto the shared connection state in [`Inner`].
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                counters: Counters::default(),
                timestamps: Mutex::new((None, None)),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn stats(&self) -> Statistics {
        let (last_connect_time, last_disconnect_time) = *self.inner.timestamps.lock().await;
        Statistics {
            connection_count: self.inner.counters.connection_count.load(Ordering::Relaxed),
            disconnection_count: self.inner.counters.disconnection_count.load(Ordering::Relaxed),
            reconnection_count: self.inner.counters.reconnection_count.load(Ordering::Relaxed),
            last_connect_time,
            last_disconnect_time,
            messages_published: self.inner.counters.messages_published.load(Ordering::Relaxed),
            publish_errors: self.inner.counters.publish_errors.load(Ordering::Relaxed),
            mqtt_publish_errors: self.inner.counters.mqtt_publish_errors.load(Ordering::Relaxed),
        }
    }

    pub async fn connect(&self) -> BrokerResult<()> {
        self.inner.connect().await
    }

    pub async fn disconnect(&self) -> BrokerResult<()> {
        self.inner.disconnect().await
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> BrokerResult<()> {
        self.inner.publish(topic, payload, qos, retain).await
    }

    pub async fn reconnect(&self) -> BrokerResult<()> {
        self.inner.reconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, RawConfig};

    fn settings() -> Arc<Settings> {
        Arc::new(validate(&RawConfig::new()).unwrap())
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let client = BrokerClient::new(settings());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn l1_disconnect_is_idempotent_when_never_connected() {
        let client = BrokerClient::new(settings());
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn publish_before_connect_is_rejected() {
        let client = BrokerClient::new(settings());
        let err = client
            .publish("msh/US/2/json/0/!a1b2c3d4", b"hi".to_vec(), 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(ConnectionState::Disconnected)));
    }

    #[tokio::test]
    async fn publish_rejects_invalid_qos_before_checking_connection() {
        let client = BrokerClient::new(settings());
        let err = client
            .publish("t", b"x".to_vec(), 9, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidPublishArgs(_)));
    }

    #[tokio::test]
    async fn publish_rejects_empty_topic() {
        let client = BrokerClient::new(settings());
        let err = client.publish("", b"x".to_vec(), 0, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidPublishArgs(_)));
    }

    #[tokio::test]
    async fn note_unexpected_loss_is_a_noop_when_not_previously_connected() {
        let client = BrokerClient::new(settings());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(!client.inner.note_unexpected_loss().await);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(client.stats().await.disconnection_count, 0);
    }

    #[tokio::test]
    async fn note_unexpected_loss_transitions_and_counts_when_previously_connected() {
        // reconnect disabled so this purely checks the state/counter
        // bookkeeping without spawning a real reconnect attempt.
        let mut disabled = (*settings()).clone();
        disabled.reconnect_enabled = false;
        let client = BrokerClient::new(Arc::new(disabled));
        client.inner.set_state(ConnectionState::Connected).await;

        assert!(client.inner.note_unexpected_loss().await);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(client.stats().await.disconnection_count, 1);
        assert!(client.stats().await.last_disconnect_time.is_some());
        assert!(client.inner.reconnect_task.lock().await.is_none());
    }
}
