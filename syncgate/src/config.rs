//! Process configuration, read once from the environment at startup.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Header carrying the credential when [`CredentialChannel::Header`] is active.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter carrying the credential on `/rooms` and, when
/// [`CredentialChannel::Query`] is active, on sync connections.
pub const API_KEY_PARAM: &str = "apiKey";

/// Where a sync connection presents its credential.
///
/// Exactly one channel is consulted. The other is ignored, never used as a
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialChannel {
    /// `x-api-key` request header.
    #[default]
    Header,
    /// `apiKey` query parameter on the connection URL.
    Query,
}

impl CredentialChannel {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "header" => Some(Self::Header),
            "query" => Some(Self::Query),
            _ => None,
        }
    }
}

/// Gateway configuration.
#[derive(Clone)]
pub struct GateConfig {
    /// Shared secret every connection and admin query must present
    pub api_key: String,
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Credential channel for sync connections
    pub credential_channel: CredentialChannel,
    /// Longest a connection may wait for its admission decision
    pub auth_timeout: Duration,
    /// Periodic reconciliation interval (None = only on close and query)
    pub reconcile_interval: Option<Duration>,
    /// Run a reconciliation pass before answering `/rooms`
    pub reconcile_on_query: bool,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Messages held per connection while authorization is pending
    pub pending_message_limit: usize,
}

// The credential must never end up in logs.
impl fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateConfig")
            .field("api_key", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credential_channel", &self.credential_channel)
            .field("auth_timeout", &self.auth_timeout)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("reconcile_on_query", &self.reconcile_on_query)
            .field("broadcast_capacity", &self.broadcast_capacity)
            .field("pending_message_limit", &self.pending_message_limit)
            .finish()
    }
}

impl GateConfig {
    /// Build a configuration with defaults for everything but the credential.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            host: "0.0.0.0".to_string(),
            port: 1234,
            credential_channel: CredentialChannel::Header,
            auth_timeout: Duration::from_millis(5000),
            reconcile_interval: Some(Duration::from_secs(30)),
            reconcile_on_query: true,
            broadcast_capacity: 256,
            pending_message_limit: 64,
        }
    }

    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("API_KEY")
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::Missing("API_KEY"))?;

        let mut config = Self::new(api_key);

        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = parsed(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(value) = lookup("AUTH_CHANNEL") {
            config.credential_channel = CredentialChannel::parse(&value)
                .ok_or(ConfigError::Invalid { name: "AUTH_CHANNEL", value })?;
        }
        if let Some(ms) = parsed::<u64, _>(&lookup, "AUTH_TIMEOUT_MS")? {
            config.auth_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "RECONCILE_INTERVAL_SECS")? {
            config.reconcile_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(value) = lookup("RECONCILE_ON_QUERY") {
            config.reconcile_on_query = parse_flag(&value)
                .ok_or(ConfigError::Invalid { name: "RECONCILE_ON_QUERY", value })?;
        }
        if let Some(capacity) = parsed::<usize, _>(&lookup, "BROADCAST_CAPACITY")? {
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    name: "BROADCAST_CAPACITY",
                    value: capacity.to_string(),
                });
            }
            config.broadcast_capacity = capacity;
        }
        if let Some(limit) = parsed(&lookup, "PENDING_MESSAGE_LIMIT")? {
            config.pending_message_limit = limit;
        }

        Ok(config)
    }

    /// `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let err = GateConfig::from_lookup(lookup_from(&[("PORT", "9000")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("API_KEY"));
    }

    #[test]
    fn test_empty_api_key_is_fatal() {
        let err = GateConfig::from_lookup(lookup_from(&[("API_KEY", "")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("API_KEY"));
    }

    #[test]
    fn test_defaults() {
        let config = GateConfig::from_lookup(lookup_from(&[("API_KEY", "secret")])).unwrap();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.port, 1234);
        assert_eq!(config.bind_addr(), "0.0.0.0:1234");
        assert_eq!(config.credential_channel, CredentialChannel::Header);
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert_eq!(config.reconcile_interval, Some(Duration::from_secs(30)));
        assert!(config.reconcile_on_query);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.pending_message_limit, 64);
    }

    #[test]
    fn test_overrides() {
        let config = GateConfig::from_lookup(lookup_from(&[
            ("API_KEY", "secret"),
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("AUTH_CHANNEL", "Query"),
            ("AUTH_TIMEOUT_MS", "250"),
            ("RECONCILE_INTERVAL_SECS", "0"),
            ("RECONCILE_ON_QUERY", "false"),
            ("BROADCAST_CAPACITY", "32"),
            ("PENDING_MESSAGE_LIMIT", "8"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.credential_channel, CredentialChannel::Query);
        assert_eq!(config.auth_timeout, Duration::from_millis(250));
        assert_eq!(config.reconcile_interval, None);
        assert!(!config.reconcile_on_query);
        assert_eq!(config.broadcast_capacity, 32);
        assert_eq!(config.pending_message_limit, 8);
    }

    #[test]
    fn test_invalid_port() {
        let err = GateConfig::from_lookup(lookup_from(&[("API_KEY", "k"), ("PORT", "http")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { name: "PORT", value: "http".to_string() }
        );
    }

    #[test]
    fn test_invalid_channel() {
        let err = GateConfig::from_lookup(lookup_from(&[
            ("API_KEY", "k"),
            ("AUTH_CHANNEL", "cookie"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "AUTH_CHANNEL", .. }));
    }

    #[test]
    fn test_zero_broadcast_capacity_rejected() {
        let err = GateConfig::from_lookup(lookup_from(&[
            ("API_KEY", "k"),
            ("BROADCAST_CAPACITY", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "BROADCAST_CAPACITY", .. }));
    }

    #[test]
    fn test_debug_redacts_credential() {
        let config = GateConfig::new("super-secret");
        let printed = format!("{config:?}");
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("<redacted>"));
    }
}
