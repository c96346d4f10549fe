//! Session configuration.
//!
//! Everything a session needs is handed to [`crate::Session::builder`] as one
//! [`SessionConfig`] value. Durations are written as integer milliseconds so
//! configs stay readable in JSON/TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serde helpers for `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// TLS policy for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Refuse to authenticate over a plaintext stream.
    #[default]
    Required,
    /// Use STARTTLS when the server offers it.
    IfPossible,
    /// Never negotiate STARTTLS.
    Disabled,
}

/// HTTP CONNECT proxy in front of a TCP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// One candidate transport. Candidates are tried in order on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// `server` accepts `tls://host:port`, `tcp://host:port`, `host:port`, or
    /// a bare domain resolved through SRV.
    Tcp {
        server: String,
        #[serde(default)]
        proxy: Option<ProxyConfig>,
    },
    /// RFC 7395 endpoint, e.g. `wss://example.com/xmpp-websocket`.
    WebSocket { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub slot_time: Duration,
    pub ceiling: u32,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slot_time: Duration::from_secs(60),
            ceiling: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// XMPP domain the stream is opened to.
    pub domain: String,
    pub transports: Vec<TransportConfig>,
    pub security: SecurityMode,
    /// Accept any server certificate. Only for development against
    /// self-signed servers.
    pub dangerous_insecure_tls: bool,
    pub lang: Option<String>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// How long `login` waits for the server to offer SASL.
    #[serde(with = "duration_ms")]
    pub sasl_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub bind_timeout: Duration,
    /// Default timeout of `query` and `send_and_await`.
    #[serde(with = "duration_ms")]
    pub query_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// Bounded wait for background tasks on shutdown.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    pub request_roster: bool,
    pub send_initial_presence: bool,
    pub reconnection: ReconnectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            transports: Vec::new(),
            security: SecurityMode::default(),
            dangerous_insecure_tls: false,
            lang: None,
            connect_timeout: Duration::from_secs(15),
            sasl_wait_timeout: Duration::from_secs(10),
            bind_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(20),
            shutdown_grace: Duration::from_millis(500),
            request_roster: false,
            send_initial_presence: true,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Config for `domain` with a single SRV-resolved TCP transport.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            transports: vec![TransportConfig::Tcp {
                server: domain.clone(),
                proxy: None,
            }],
            domain,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_session()?;
        if self.transports.is_empty() {
            return Err(Error::Config("at least one transport is required".to_string()));
        }
        for transport in &self.transports {
            match transport {
                TransportConfig::Tcp { server, .. } if server.trim().is_empty() => {
                    return Err(Error::Config("TCP transport has an empty server".to_string()));
                }
                TransportConfig::WebSocket { url }
                    if !(url.starts_with("ws://") || url.starts_with("wss://")) =>
                {
                    return Err(Error::Config(format!(
                        "WebSocket URL must use ws:// or wss://, got '{}'",
                        url
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Checks everything except the transport list, for sessions whose
    /// transports are supplied directly.
    pub fn validate_session(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(Error::Config("domain must not be empty".to_string()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(Error::Config("keepalive_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
