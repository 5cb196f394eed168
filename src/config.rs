//! Configuration validator
//!
//! Normalizes a free-form `string -> value` map into a typed, validated
//! [`Settings`] record. Unknown keys are ignored; missing optional keys take
//! defaults; every recognized key is checked for type, then range or
//! enumeration, then cross-field constraints. Everything downstream of
//! validation receives this typed record rather than the raw map.

use crate::error::{ConfigError, ConfigResult};
use std::collections::HashMap;
use std::path::Path;

/// Raw configuration map as handed to the validator. In this binary it is
/// populated by parsing a TOML file at startup; the validator itself
/// is agnostic to where the map came from.
pub type RawConfig = HashMap<String, toml::Value>;

/// Payload serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Protobuf,
}

/// Normalized log level, case-insensitive on input and upper-cased on
/// output. `CRITICAL` maps onto `tracing::Level::ERROR`, there being no more
/// severe tracing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Per-channel uplink policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    pub uplink_enabled: bool,
    pub message_types: Vec<String>,
}

/// Validated, immutable configuration record. Created once at
/// initialization; every field was either supplied by the caller or
/// defaulted by the validator.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub enabled: bool,
    pub broker_address: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub tls_enabled: bool,
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
    pub root_topic: String,
    pub region: String,
    pub format: PayloadFormat,
    pub encryption_enabled: bool,
    pub max_messages_per_second: u32,
    pub burst_multiplier: f64,
    pub queue_max_size: usize,
    pub queue_persist: bool,
    pub reconnect_enabled: bool,
    pub reconnect_initial_delay: f64,
    pub reconnect_max_delay: f64,
    pub reconnect_multiplier: f64,
    pub max_reconnect_attempts: i64,
    pub log_level: LogLevel,
    pub log_published_messages: bool,
    /// Keyed by the channel record's `name` field, which is what mesh
    /// messages' decimal `channel` index is compared against (the channel
    /// index is stringified for lookup; see Formatter::is_channel_forwardable).
    pub channels: HashMap<String, ChannelConfig>,
    /// True iff a `channels` key was present in the raw map at all (even an
    /// empty list). Governs the "no channels configured -> every channel
    /// uplink-enabled" legacy-compatibility rule.
    pub channels_configured: bool,
}

impl Settings {
    /// Whether `channel` (looked up by its decimal string form) may be
    /// forwarded, and if so, what message-type allowlist (if any) applies.
    pub fn channel_policy(&self, channel: u32) -> ChannelPolicy<'_> {
        let key = channel.to_string();
        match self.channels.get(&key) {
            Some(cfg) => ChannelPolicy {
                uplink_enabled: cfg.uplink_enabled,
                message_types: Some(&cfg.message_types),
            },
            None => {
                if self.channels_configured {
                    ChannelPolicy {
                        uplink_enabled: false,
                        message_types: None,
                    }
                } else {
                    ChannelPolicy {
                        uplink_enabled: true,
                        message_types: None,
                    }
                }
            }
        }
    }
}

pub struct ChannelPolicy<'a> {
    pub uplink_enabled: bool,
    pub message_types: Option<&'a Vec<String>>,
}

impl ChannelPolicy<'_> {
    pub fn allows(&self, tag: &str) -> bool {
        if !self.uplink_enabled {
            return false;
        }
        match self.message_types {
            None => true,
            Some(types) if types.is_empty() => true,
            Some(types) => types.iter().any(|t| t.eq_ignore_ascii_case(tag)),
        }
    }
}

/// Load a TOML file from disk into the generic map handed to [`validate`].
/// Mirrors the host-framework-supplied-map contract: the validator itself
/// never sees a file path, only the map.
pub fn load_raw_config(path: &Path) -> ConfigResult<RawConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::CrossFieldConstraint {
        field: "<file>".to_string(),
        reason: format!("could not read {}: {e}", path.display()),
    })?;
    let value: toml::Value =
        toml::from_str(&text).map_err(|e| ConfigError::CrossFieldConstraint {
            field: "<file>".to_string(),
            reason: format!("could not parse {}: {e}", path.display()),
        })?;
    match value {
        toml::Value::Table(table) => Ok(table.into_iter().collect()),
        other => Err(ConfigError::InvalidType {
            field: "<root>".to_string(),
            expected: "table".to_string(),
            observed: format!("{other:?}"),
        }),
    }
}

fn type_name(v: &toml::Value) -> &'static str {
    match v {
        toml::Value::String(_) => "string",
        toml::Value::Integer(_) => "integer",
        toml::Value::Float(_) => "float",
        toml::Value::Boolean(_) => "bool",
        toml::Value::Datetime(_) => "datetime",
        toml::Value::Array(_) => "array",
        toml::Value::Table(_) => "table",
    }
}

fn get_bool(raw: &RawConfig, field: &str, default: bool) -> ConfigResult<bool> {
    match raw.get(field) {
        None => Ok(default),
        Some(toml::Value::Boolean(b)) => Ok(*b),
        Some(v) => Err(ConfigError::InvalidType {
            field: field.to_string(),
            expected: "bool".to_string(),
            observed: type_name(v).to_string(),
        }),
    }
}

fn get_string(raw: &RawConfig, field: &str, default: &str) -> ConfigResult<String> {
    match raw.get(field) {
        None => Ok(default.to_string()),
        Some(toml::Value::String(s)) => Ok(s.clone()),
        Some(v) => Err(ConfigError::InvalidType {
            field: field.to_string(),
            expected: "string".to_string(),
            observed: type_name(v).to_string(),
        }),
    }
}

/// `max_messages_per_second` is specified as "number coerced to integer" -
/// accept either an integer or a float and round toward the nearest integer.
fn get_coerced_int(raw: &RawConfig, field: &str, default: i64) -> ConfigResult<i64> {
    match raw.get(field) {
        None => Ok(default),
        Some(toml::Value::Integer(n)) => Ok(*n),
        Some(toml::Value::Float(f)) => {
            if f.is_nan() || f.is_infinite() {
                return Err(ConfigError::OutOfRange {
                    field: field.to_string(),
                    observed: f.to_string(),
                    constraint: "finite number".to_string(),
                });
            }
            Ok(f.round() as i64)
        }
        Some(v) => Err(ConfigError::InvalidType {
            field: field.to_string(),
            expected: "number".to_string(),
            observed: type_name(v).to_string(),
        }),
    }
}

fn get_float(raw: &RawConfig, field: &str, default: f64) -> ConfigResult<f64> {
    match raw.get(field) {
        None => Ok(default),
        Some(toml::Value::Float(f)) => Ok(*f),
        Some(toml::Value::Integer(n)) => Ok(*n as f64),
        Some(v) => Err(ConfigError::InvalidType {
            field: field.to_string(),
            expected: "real number".to_string(),
            observed: type_name(v).to_string(),
        }),
    }
}

fn check_finite(field: &str, value: f64) -> ConfigResult<f64> {
    if value.is_nan() || value.is_infinite() {
        return Err(ConfigError::OutOfRange {
            field: field.to_string(),
            observed: value.to_string(),
            constraint: "finite number".to_string(),
        });
    }
    Ok(value)
}

fn check_range_f64(field: &str, value: f64, min: f64, max: f64) -> ConfigResult<f64> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field: field.to_string(),
            observed: value.to_string(),
            constraint: format!("{min}..={max}"),
        });
    }
    Ok(value)
}

fn check_range_i64(field: &str, value: i64, min: i64, max: i64) -> ConfigResult<i64> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field: field.to_string(),
            observed: value.to_string(),
            constraint: format!("{min}..={max}"),
        });
    }
    Ok(value)
}

fn parse_channels(raw: &RawConfig) -> ConfigResult<(HashMap<String, ChannelConfig>, bool)> {
    let Some(value) = raw.get("channels") else {
        return Ok((HashMap::new(), false));
    };
    let entries = match value {
        toml::Value::Array(entries) => entries,
        v => {
            return Err(ConfigError::InvalidType {
                field: "channels".to_string(),
                expected: "array of tables".to_string(),
                observed: type_name(v).to_string(),
            })
        }
    };

    let mut channels = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        let table = match entry {
            toml::Value::Table(t) => t,
            v => {
                return Err(ConfigError::InvalidType {
                    field: format!("channels[{idx}]"),
                    expected: "table".to_string(),
                    observed: type_name(v).to_string(),
                })
            }
        };

        let name = match table.get("name") {
            Some(toml::Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(toml::Value::String(_)) => {
                return Err(ConfigError::CrossFieldConstraint {
                    field: format!("channels[{idx}].name"),
                    reason: "must be non-empty".to_string(),
                })
            }
            Some(v) => {
                return Err(ConfigError::InvalidType {
                    field: format!("channels[{idx}].name"),
                    expected: "string".to_string(),
                    observed: type_name(v).to_string(),
                })
            }
            None => {
                return Err(ConfigError::CrossFieldConstraint {
                    field: format!("channels[{idx}].name"),
                    reason: "required field missing".to_string(),
                })
            }
        };

        let uplink_enabled = match table.get("uplink_enabled") {
            None => true,
            Some(toml::Value::Boolean(b)) => *b,
            Some(v) => {
                return Err(ConfigError::InvalidType {
                    field: format!("channels[{idx}].uplink_enabled"),
                    expected: "bool".to_string(),
                    observed: type_name(v).to_string(),
                })
            }
        };

        let message_types = match table.get("message_types") {
            None => Vec::new(),
            Some(toml::Value::Array(tags)) => {
                let mut out = Vec::with_capacity(tags.len());
                for (tidx, tag) in tags.iter().enumerate() {
                    match tag {
                        toml::Value::String(s) => out.push(s.clone()),
                        v => {
                            return Err(ConfigError::InvalidType {
                                field: format!("channels[{idx}].message_types[{tidx}]"),
                                expected: "string".to_string(),
                                observed: type_name(v).to_string(),
                            })
                        }
                    }
                }
                out
            }
            Some(v) => {
                return Err(ConfigError::InvalidType {
                    field: format!("channels[{idx}].message_types"),
                    expected: "array of strings".to_string(),
                    observed: type_name(v).to_string(),
                })
            }
        };

        channels.insert(
            name.clone(),
            ChannelConfig {
                name,
                uplink_enabled,
                message_types,
            },
        );
    }

    Ok((channels, true))
}

/// Validate a raw configuration map into a typed [`Settings`] record.
/// Unknown keys are ignored. On any failure, initialization does not
/// proceed; the caller sees a single descriptive [`ConfigError`].
pub fn validate(raw: &RawConfig) -> ConfigResult<Settings> {
    let enabled = get_bool(raw, "enabled", false)?;

    let broker_address = get_string(raw, "broker_address", "mqtt.meshtastic.org")?;
    if broker_address.trim().is_empty() {
        return Err(ConfigError::CrossFieldConstraint {
            field: "broker_address".to_string(),
            reason: "must be non-empty after trimming".to_string(),
        });
    }

    let broker_port = check_range_i64(
        "broker_port",
        get_coerced_int(raw, "broker_port", 1883)?,
        1,
        65535,
    )? as u16;

    let username = get_string(raw, "username", "")?;
    let password = get_string(raw, "password", "")?;
    let tls_enabled = get_bool(raw, "tls_enabled", false)?;
    let ca_cert = get_string(raw, "ca_cert", "")?;
    let client_cert = get_string(raw, "client_cert", "")?;
    let client_key = get_string(raw, "client_key", "")?;

    let root_topic = get_string(raw, "root_topic", "msh/US")?;
    if root_topic.trim().is_empty() {
        return Err(ConfigError::CrossFieldConstraint {
            field: "root_topic".to_string(),
            reason: "must be non-empty".to_string(),
        });
    }
    if root_topic.contains('+') || root_topic.contains('#') {
        return Err(ConfigError::CrossFieldConstraint {
            field: "root_topic".to_string(),
            reason: "must not contain MQTT wildcards '+' or '#'".to_string(),
        });
    }

    let region = get_string(raw, "region", "US")?;
    let region_len = region.trim().len();
    if !(2..=10).contains(&region_len) {
        return Err(ConfigError::OutOfRange {
            field: "region".to_string(),
            observed: region.clone(),
            constraint: "2..=10 characters after trimming".to_string(),
        });
    }

    let format_str = get_string(raw, "format", "json")?;
    let format = match format_str.as_str() {
        "json" => PayloadFormat::Json,
        "protobuf" => PayloadFormat::Protobuf,
        other => {
            return Err(ConfigError::InvalidEnum {
                field: "format".to_string(),
                observed: other.to_string(),
                allowed: "{\"json\", \"protobuf\"}".to_string(),
            })
        }
    };

    let encryption_enabled = get_bool(raw, "encryption_enabled", false)?;

    let max_messages_per_second =
        check_range_i64(
            "max_messages_per_second",
            get_coerced_int(raw, "max_messages_per_second", 10)?,
            1,
            1000,
        )? as u32;

    let burst_multiplier = check_range_f64(
        "burst_multiplier",
        check_finite("burst_multiplier", get_float(raw, "burst_multiplier", 2.0)?)?,
        1.0,
        10.0,
    )?;

    let queue_max_size = check_range_i64(
        "queue_max_size",
        get_coerced_int(raw, "queue_max_size", 1000)?,
        10,
        100_000,
    )? as usize;

    let queue_persist = get_bool(raw, "queue_persist", false)?;
    let reconnect_enabled = get_bool(raw, "reconnect_enabled", true)?;

    let reconnect_initial_delay = check_range_f64(
        "reconnect_initial_delay",
        check_finite(
            "reconnect_initial_delay",
            get_float(raw, "reconnect_initial_delay", 1.0)?,
        )?,
        0.1,
        60.0,
    )?;

    let reconnect_max_delay = check_range_f64(
        "reconnect_max_delay",
        check_finite(
            "reconnect_max_delay",
            get_float(raw, "reconnect_max_delay", 60.0)?,
        )?,
        1.0,
        3600.0,
    )?;

    if reconnect_max_delay < reconnect_initial_delay {
        return Err(ConfigError::CrossFieldConstraint {
            field: "reconnect_max_delay".to_string(),
            reason: format!(
                "must be >= reconnect_initial_delay ({reconnect_initial_delay}), got {reconnect_max_delay}"
            ),
        });
    }

    let reconnect_multiplier = check_range_f64(
        "reconnect_multiplier",
        get_float(raw, "reconnect_multiplier", 2.0)?,
        1.0,
        10.0,
    )?;

    let max_reconnect_attempts = get_coerced_int(raw, "max_reconnect_attempts", -1)?;
    if max_reconnect_attempts < -1 {
        return Err(ConfigError::OutOfRange {
            field: "max_reconnect_attempts".to_string(),
            observed: max_reconnect_attempts.to_string(),
            constraint: ">= -1".to_string(),
        });
    }

    let log_level_str = get_string(raw, "log_level", "INFO")?.to_uppercase();
    let log_level = match log_level_str.as_str() {
        "DEBUG" => LogLevel::Debug,
        "INFO" => LogLevel::Info,
        "WARNING" => LogLevel::Warning,
        "ERROR" => LogLevel::Error,
        "CRITICAL" => LogLevel::Critical,
        other => {
            return Err(ConfigError::InvalidEnum {
                field: "log_level".to_string(),
                observed: other.to_string(),
                allowed: "{DEBUG, INFO, WARNING, ERROR, CRITICAL}".to_string(),
            })
        }
    };

    let log_published_messages = get_bool(raw, "log_published_messages", true)?;

    let (channels, channels_configured) = parse_channels(raw)?;

    Ok(Settings {
        enabled,
        broker_address,
        broker_port,
        username,
        password,
        tls_enabled,
        ca_cert,
        client_cert,
        client_key,
        root_topic,
        region,
        format,
        encryption_enabled,
        max_messages_per_second,
        burst_multiplier,
        queue_max_size,
        queue_persist,
        reconnect_enabled,
        reconnect_initial_delay,
        reconnect_max_delay,
        reconnect_multiplier,
        max_reconnect_attempts,
        log_level,
        log_published_messages,
        channels,
        channels_configured,
    })
}
