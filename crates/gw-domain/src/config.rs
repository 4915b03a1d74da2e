//! Recognized configuration keys and their effects, per §6.
//!
//! Loaded the way the teacher's API config loads: `GW_`-prefixed
//! environment variables with hardcoded defaults
//! (`GatewayConfig::from_env`), plus a file-based path for the
//! naturally declarative `streams[]`/`consumers[]` lists.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub max_message_size: usize,
    pub message_rate_limit_per_second: f64,
    pub outgoing_buffer_size: usize,

    #[serde(with = "duration_secs")]
    pub authentication_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,

    pub nats: NatsConfig,
    pub jwt: JwtConfig,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,

    pub publish_retry_policy: PublishRetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub use_jetstream: bool,
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    #[serde(with = "duration_secs")]
    pub clock_skew: Duration,
    #[serde(with = "duration_secs")]
    pub default_expiry: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    Limits,
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    Memory,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discard {
    Old,
    New,
}

/// A declarative JetStream stream, reconciled at startup: created if
/// absent; an existing stream with mismatched critical fields logs a
/// warning and is left untouched unless `allow_reconcile` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    #[serde(default, with = "duration_secs_opt")]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub max_msgs: Option<i64>,
    #[serde(default)]
    pub max_bytes: Option<i64>,
    #[serde(default)]
    pub max_msg_size: Option<i32>,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    pub discard: Discard,
    #[serde(default)]
    pub allow_reconcile: bool,
}

fn default_replicas() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    All,
    New,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    Instant,
    Original,
}

/// A declarative JetStream consumer template. Per-session consumers
/// override `durable_name` with the gateway-chosen
/// `gw-<clientId>-<hash(pattern)>` name to enable resume-on-reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub delivery_policy: DeliveryPolicy,
    #[serde(default = "default_ack_wait_secs", with = "duration_secs")]
    pub ack_wait: Duration,
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: i64,
    pub replay_policy: ReplayPolicy,
}

fn default_ack_wait_secs() -> Duration {
    Duration::from_secs(30)
}
fn default_max_deliver() -> i64 {
    5
}
fn default_max_ack_pending() -> i64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            message_rate_limit_per_second: 50.0,
            outgoing_buffer_size: 256,
            authentication_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                use_jetstream: true,
                connection_timeout: Duration::from_secs(5),
                reconnect_delay: Duration::from_secs(2),
                max_reconnect_attempts: 60,
            },
            jwt: JwtConfig {
                secret: String::new(),
                issuer: None,
                audience: None,
                clock_skew: Duration::from_secs(30),
                default_expiry: Duration::from_secs(3600),
            },
            streams: Vec::new(),
            consumers: Vec::new(),
            publish_retry_policy: PublishRetryPolicy::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads overrides from `GW_`-prefixed environment variables over
    /// the defaults above. Unset variables keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_usize("GW_MAX_MESSAGE_SIZE") {
            config.max_message_size = v;
        }
        if let Some(v) = env_f64("GW_MESSAGE_RATE_LIMIT_PER_SECOND") {
            config.message_rate_limit_per_second = v;
        }
        if let Some(v) = env_usize("GW_OUTGOING_BUFFER_SIZE") {
            config.outgoing_buffer_size = v;
        }
        if let Some(v) = env_secs("GW_AUTHENTICATION_TIMEOUT") {
            config.authentication_timeout = v;
        }
        if let Some(v) = env_secs("GW_PING_INTERVAL") {
            config.ping_interval = v;
        }
        if let Some(v) = env_secs("GW_PING_TIMEOUT") {
            config.ping_timeout = v;
        }
        if let Ok(v) = env::var("GW_NATS_URL") {
            config.nats.url = v;
        }
        if let Ok(v) = env::var("GW_NATS_USE_JETSTREAM") {
            config.nats.use_jetstream = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("GW_JWT_SECRET") {
            config.jwt.secret = v;
        }
        if let Ok(v) = env::var("GW_JWT_ISSUER") {
            config.jwt.issuer = Some(v);
        }
        if let Ok(v) = env::var("GW_JWT_AUDIENCE") {
            config.jwt.audience = Some(v);
        }
        if let Some(v) = env_secs("GW_JWT_CLOCK_SKEW") {
            config.jwt.clock_skew = v;
        }

        config
    }

    /// Loads `streams[]`/`consumers[]` and any other keys from a YAML
    /// file, layered on top of `from_env`. Unrecognized top-level keys
    /// in the file are logged as warnings, never rejected.
    pub fn from_file_and_env(path: &std::path::Path) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigLoadError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let raw: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| ConfigLoadError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if let Some(mapping) = raw.as_mapping() {
            for key in mapping.keys() {
                let key = key.as_str().unwrap_or("<non-string key>");
                if !matches!(key, "streams" | "consumers") {
                    tracing::warn!(path = %path.display(), key, "unrecognized config key, ignoring");
                }
            }
        }

        let mut file_config: PartialFileConfig =
            serde_yaml::from_value(raw).map_err(|e| ConfigLoadError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut config = Self::from_env();
        config.streams = std::mem::take(&mut file_config.streams);
        config.consumers = std::mem::take(&mut file_config.consumers);
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialFileConfig {
    #[serde(default)]
    streams: Vec<StreamConfig>,
    #[serde(default)]
    consumers: Vec<ConsumerConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert!(config.nats.use_jetstream);
        assert_eq!(config.publish_retry_policy.max_retries, 5);
    }

    #[test]
    fn from_env_overrides_specific_keys() {
        env::set_var("GW_MAX_MESSAGE_SIZE", "1024");
        env::set_var("GW_JWT_SECRET", "test-secret");
        let config = GatewayConfig::from_env();
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.jwt.secret, "test-secret");
        env::remove_var("GW_MAX_MESSAGE_SIZE");
        env::remove_var("GW_JWT_SECRET");
    }
}
