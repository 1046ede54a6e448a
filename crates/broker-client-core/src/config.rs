//! Connection and endpoint configuration.
//!
//! Configuration is an explicit value object handed to the connection
//! manager. It can be built in code or loaded with [`MessagingConfig::load`],
//! which layers channel defaults, a JSON, TOML or Java properties file
//! (`solace.java.*` / `solace.message.*` keys) and `BROKER_CLIENT_*`
//! environment overrides.

use std::{collections::HashMap, fmt, path::Path, str::FromStr, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix of environment overrides, e.g. `BROKER_CLIENT_BROKER__PASSWORD`.
pub const ENV_PREFIX: &str = "BROKER_CLIENT_";

/// Retry budget for one connection phase.
///
/// Serialized as an integer where any negative value means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Retries {
    /// At most this many retries.
    Limited(u32),
    /// Retry forever.
    Unlimited,
}

impl Retries {
    /// Whether the retry with zero-based index `retry` is within budget.
    #[must_use]
    pub const fn permits(self, retry: u32) -> bool {
        match self {
            Self::Limited(limit) => retry < limit,
            Self::Unlimited => true,
        }
    }
}

impl From<i32> for Retries {
    fn from(value: i32) -> Self {
        u32::try_from(value).map_or(Self::Unlimited, Self::Limited)
    }
}

impl From<Retries> for i32 {
    fn from(value: Retries) -> Self {
        match value {
            Retries::Limited(n) => Self::try_from(n).unwrap_or(Self::MAX),
            Retries::Unlimited => -1,
        }
    }
}

impl fmt::Display for Retries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Channel-level reliability settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelProperties {
    /// Reconnect rounds after an established session goes down.
    pub reconnect_retries: Retries,
    /// Extra attempts on each host before moving to the next one.
    pub connect_retries_per_host: Retries,
    /// Extra passes over the whole host list on initial connect.
    pub connect_retries: Retries,
    /// Wait between consecutive attempts, in milliseconds.
    pub reconnect_retry_wait_ms: u64,
}

impl Default for ChannelProperties {
    fn default() -> Self {
        Self {
            reconnect_retries: Retries::Limited(3),
            connect_retries_per_host: Retries::Limited(0),
            connect_retries: Retries::Limited(0),
            reconnect_retry_wait_ms: 3000,
        }
    }
}

impl ChannelProperties {
    #[must_use]
    pub const fn reconnect_retry_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_wait_ms)
    }
}

/// Broker session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host address, or a comma separated list tried in order.
    pub host: String,
    /// Message VPN name.
    #[serde(default = "default_vpn")]
    pub vpn_name: String,
    /// Client username.
    pub username: String,
    /// Client password.
    #[serde(default)]
    pub password: String,
    /// Re-add recorded subscriptions after a reconnect.
    #[serde(default = "default_true")]
    pub reapply_subscriptions: bool,
    /// Retry policy.
    #[serde(default)]
    pub channel: ChannelProperties,
}

fn default_vpn() -> String {
    "default".to_string()
}

const fn default_true() -> bool {
    true
}

impl BrokerConfig {
    /// Create a configuration with default channel settings.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        vpn_name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            vpn_name: vpn_name.into(),
            username: username.into(),
            password: password.into(),
            reapply_subscriptions: true,
            channel: ChannelProperties::default(),
        }
    }

    /// Replace the channel properties.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelProperties) -> Self {
        self.channel = channel;
        self
    }

    /// Set the reapply-subscriptions flag.
    #[must_use]
    pub const fn with_reapply_subscriptions(mut self, reapply: bool) -> Self {
        self.reapply_subscriptions = reapply;
        self
    }

    /// Hosts in connection order.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.host
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect()
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    /// Returns error if the host list or username is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts().is_empty() {
            return Err(ConfigError::Missing("host".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::Missing("username".to_string()));
        }
        Ok(())
    }
}

/// Acknowledgement mode of a consumer flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Messages are acknowledged on receipt.
    #[default]
    Auto,
    /// The handler acknowledges each message explicitly.
    Client,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "supported_message_ack_auto" => Ok(Self::Auto),
            "client" | "explicit" | "supported_message_ack_client" => Ok(Self::Client),
            other => Err(format!("unknown ack mode '{other}'")),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Endpoints the application consumes from and publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Queue consumed by the queue flow.
    pub queue: String,
    /// Durable topic endpoint consumed by the topic flow.
    pub topic_endpoint: String,
    /// Topic the publisher writes to and the topic endpoint subscribes to.
    pub publisher_topic: String,
    /// Selector applied to the topic endpoint flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub queue_ack_mode: AckMode,
    #[serde(default = "client_ack")]
    pub topic_endpoint_ack_mode: AckMode,
}

const fn client_ack() -> AckMode {
    AckMode::Client
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub broker: BrokerConfig,
    pub endpoints: EndpointConfig,
}

impl MessagingConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    /// Returns error on malformed JSON or an invalid broker section.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.broker.validate()?;
        Ok(config)
    }

    /// Parse a properties document using the `solace.*` keys.
    ///
    /// # Errors
    /// Returns error if a required key is missing or a value does not parse.
    pub fn from_properties(text: &str) -> Result<Self, ConfigError> {
        let props = java_properties::read(text.as_bytes())?;
        let defaults = ChannelProperties::default();

        let channel = ChannelProperties {
            reconnect_retries: optional::<i32>(&props, "solace.java.reconnectRetries")?
                .map_or(defaults.reconnect_retries, Retries::from),
            connect_retries_per_host: optional::<i32>(&props, "solace.java.connectRetriesPerHost")?
                .map_or(defaults.connect_retries_per_host, Retries::from),
            connect_retries: optional::<i32>(&props, "solace.java.connectRetries")?
                .map_or(defaults.connect_retries, Retries::from),
            reconnect_retry_wait_ms: optional(&props, "solace.java.reconnectRetryWaitInMillis")?
                .unwrap_or(defaults.reconnect_retry_wait_ms),
        };

        let broker = BrokerConfig {
            host: required(&props, "solace.java.host")?,
            vpn_name: props
                .get("solace.java.msgVpn")
                .cloned()
                .unwrap_or_else(default_vpn),
            username: required(&props, "solace.java.clientUsername")?,
            password: props
                .get("solace.java.clientPassword")
                .cloned()
                .unwrap_or_default(),
            reapply_subscriptions: optional(&props, "solace.java.reapplySubscriptions")?
                .unwrap_or(true),
            channel,
        };
        broker.validate()?;

        let endpoints = EndpointConfig {
            queue: required(&props, "solace.message.consumer.queue")?,
            topic_endpoint: required(&props, "solace.message.consumer.topicEP")?,
            publisher_topic: required(&props, "solace.message.publisher.topic")?,
            selector: props
                .get("solace.message.consumer.selector")
                .filter(|s| !s.trim().is_empty())
                .cloned(),
            queue_ack_mode: optional(&props, "solace.message.consumer.queue.ackMode")?
                .unwrap_or(AckMode::Auto),
            topic_endpoint_ack_mode: optional(&props, "solace.message.consumer.topicEP.ackMode")?
                .unwrap_or(AckMode::Client),
        };

        Ok(Self { broker, endpoints })
    }

    /// Load from a file, then apply `BROKER_CLIENT_*` environment overrides.
    ///
    /// `.json` and `.toml` files are read as such; anything else is read as a
    /// properties file. Nested keys in the environment are separated by `__`.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or the merged
    /// configuration is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let figment = Figment::from(Serialized::default(
            "broker.channel",
            ChannelProperties::default(),
        ));
        let figment = match extension.as_deref() {
            Some("json") => figment.merge(Json::string(&text)),
            Some("toml") => figment.merge(Toml::string(&text)),
            _ => figment.merge(Serialized::defaults(Self::from_properties(&text)?)),
        };
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration from a prepared figment.
    ///
    /// # Errors
    /// Returns error if extraction fails or the broker section is invalid.
    pub fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.broker.validate()?;
        Ok(config)
    }
}

fn required(props: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    props
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn optional<T>(props: &HashMap<String, String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    props
        .get(key)
        .map(|value| {
            value.parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
