//! Connection configuration.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::frame::{Connect, PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::framer::MAX_PACKET_SIZE;
use crate::types::QoS;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Broker connection settings consumed by the session.
///
/// Can be built in code with the `with_*` methods or deserialized from a
/// config file; durations are given in milliseconds there
/// (`connect_timeout_ms`, `reconnect.initial_delay_ms`, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID.
    pub client_id: String,
    /// Protocol name sent in CONNECT.
    pub protocol: String,
    /// Protocol level sent in CONNECT.
    pub version: u8,
    /// Keep alive interval in seconds (0 disables it).
    pub keep_alive: u16,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Will topic. Must be set together with `will_message`.
    pub will_topic: Option<String>,
    /// Will message. Must be set together with `will_topic`.
    pub will_message: Option<String>,
    /// Retain flag for the will.
    pub will_retain: bool,
    /// QoS for the will.
    pub will_qos: QoS,
    /// Clean session flag.
    pub clean_session: bool,
    /// Send PINGREQ at `keep_alive / 2` intervals while connected.
    pub auto_keepalive: bool,
    /// Upper bound for opening the transport and for waiting on CONNACK.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// Maximum inbound packet size.
    pub max_packet_size: usize,
    /// How many frames a slow observer may fall behind before it lags.
    pub channel_capacity: usize,
    /// What to do when an established connection drops.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: String::new(),
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_LEVEL,
            keep_alive: 60,
            username: None,
            password: None,
            will_topic: None,
            will_message: None,
            will_retain: false,
            will_qos: QoS::AtMostOnce,
            clean_session: false,
            auto_keepalive: true,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: MAX_PACKET_SIZE,
            channel_capacity: 1024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for `host` on the default port.
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Parse an address of the form `mqtt://[user:pass@]host[:port]`.
    pub fn from_url(addr: &str, client_id: impl Into<String>) -> Result<Self> {
        let url = url::Url::parse(addr).map_err(|e| Error::InvalidConfig(format!("{}: {}", addr, e)))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            other => {
                return Err(Error::InvalidConfig(format!("unsupported scheme: {}", other)));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidConfig(format!("missing host: {}", addr)))?;

        let mut config = Self::new(host, client_id).with_port(url.port().unwrap_or(DEFAULT_PORT));
        if !url.username().is_empty() {
            config.username = Some(url.username().to_string());
        }
        if let Some(password) = url.password() {
            config.password = Some(password.to_string());
        }

        Ok(config)
    }

    /// Set broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set protocol name and level.
    pub fn with_protocol(mut self, protocol: impl Into<String>, version: u8) -> Self {
        self.protocol = protocol.into();
        self.version = version;
        self
    }

    /// Set the will.
    pub fn with_will(
        mut self,
        topic: impl Into<String>,
        message: impl Into<String>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will_topic = Some(topic.into());
        self.will_message = Some(message.into());
        self.will_qos = qos;
        self.will_retain = retain;
        self
    }

    /// Enable or disable automatic keep-alive.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }

    /// Set the transport open and CONNACK timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the largest inbound packet accepted; bigger ones are dropped.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set how many frames each observer may buffer.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Build the CONNECT frame for this configuration.
    pub fn connect_frame(&self) -> Result<Connect> {
        let connect = Connect::new(self.client_id.clone())
            .with_protocol(self.protocol.clone(), self.version)
            .with_keep_alive(self.keep_alive)
            .with_clean_session(self.clean_session)
            .with_credentials(self.username.clone(), self.password.clone().map(Bytes::from))
            .with_will_parts(
                self.will_topic.clone(),
                self.will_message.clone().map(Bytes::from),
                self.will_qos,
                self.will_retain,
            )?;
        Ok(connect)
    }

    /// Check the settings the session cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host is empty".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig("channel capacity must be positive".to_string()));
        }
        if self.max_packet_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "max packet size {} is below the 2 byte minimum",
                self.max_packet_size
            )));
        }
        self.connect_frame().map(|_| ())
    }
}

/// Reconnection policy for an established connection that drops.
///
/// Attempt `n` (starting at 1) waits `initial_delay * 2^(n-1)`, capped at
/// `max_delay`, before reopening the transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect at all.
    pub enabled: bool,
    /// Wait before the first attempt.
    #[serde(rename = "initial_delay_ms", deserialize_with = "millis")]
    pub initial_delay: Duration,
    /// Cap on the doubled wait.
    #[serde(rename = "max_delay_ms", deserialize_with = "millis")]
    pub max_delay: Duration,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Retry immediately, forever.
    pub fn immediate() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Never reconnect.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }

    /// Give up after `attempts` failed attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
