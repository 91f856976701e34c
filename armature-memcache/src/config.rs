//! Connection configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

const URL_SCHEME: &str = "memcache://";

/// Address of one memcached server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddr {
    host: String,
    port: u16,
}

impl ServerAddr {
    /// Create an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL form understood by the `memcache` crate.
    pub fn to_url(&self) -> String {
        format!("{}{}", URL_SCHEME, self)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = io::Error;

    /// Accepts `host:port` or `memcache://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid Memcached address: {}. Expected format: 'memcache://host:port' or 'host:port'",
                    s
                ),
            )
        };

        let trimmed = s.trim();
        let rest = trimmed.strip_prefix(URL_SCHEME).unwrap_or(trimmed);
        let rest = rest.split(['?', '/']).next().unwrap_or_default();
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for ServerAddr {
    type Error = io::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddr> for String {
    fn from(addr: ServerAddr) -> Self {
        addr.to_string()
    }
}

/// How to build a memcached client.
///
/// Created once at startup and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Servers in the cluster.
    #[serde(default)]
    pub servers: Vec<ServerAddr>,
    /// Select servers with a ketama consistent-hash ring instead of modulo.
    #[serde(default)]
    pub consistent_hashing: bool,
    /// Use the binary wire protocol instead of the text protocol.
    #[serde(default)]
    pub use_binary_protocol: bool,
    /// Per-operation timeout.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub operation_timeout: Duration,
    /// Maximum time a server may stay disconnected before its data is
    /// considered stale on reconnect. `None` disables reconnect monitoring.
    #[serde(with = "humantime_serde", default)]
    pub max_away_time: Option<Duration>,
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(1000)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            consistent_hashing: false,
            use_binary_protocol: false,
            operation_timeout: default_operation_timeout(),
            max_away_time: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a builder.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// - `MEMCACHED_SERVERS` - comma separated `host:port` list
    /// - `MEMCACHED_CONSISTENT_HASHING` - `1`/`true` to enable ketama
    /// - `MEMCACHED_BINARY_PROTOCOL` - `1`/`true` to use the binary protocol
    /// - `MEMCACHED_OPERATION_TIMEOUT` - e.g. `500ms`, `2s`
    /// - `MEMCACHED_MAX_AWAY_TIME` - e.g. `30s`
    pub fn from_env() -> ConnectionConfigBuilder {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values are skipped with a warning.
    pub fn from_lookup<F>(lookup: F) -> ConnectionConfigBuilder
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = ConnectionConfigBuilder::default();

        if let Some(servers) = lookup("MEMCACHED_SERVERS") {
            for server in servers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match server.parse() {
                    Ok(addr) => builder = builder.server(addr),
                    Err(e) => armature_log::warn!("Ignoring MEMCACHED_SERVERS entry: {}", e),
                }
            }
        }

        if let Some(flag) = lookup("MEMCACHED_CONSISTENT_HASHING") {
            builder = builder.consistent_hashing(parse_flag(&flag));
        }

        if let Some(flag) = lookup("MEMCACHED_BINARY_PROTOCOL") {
            builder = builder.use_binary_protocol(parse_flag(&flag));
        }

        if let Some(timeout) = lookup("MEMCACHED_OPERATION_TIMEOUT") {
            match humantime::parse_duration(&timeout) {
                Ok(timeout) => builder = builder.operation_timeout(timeout),
                Err(e) => {
                    armature_log::warn!("Ignoring MEMCACHED_OPERATION_TIMEOUT value {:?}: {}", timeout, e)
                }
            }
        }

        if let Some(away) = lookup("MEMCACHED_MAX_AWAY_TIME") {
            match humantime::parse_duration(&away) {
                Ok(away) => builder = builder.max_away_time(away),
                Err(e) => {
                    armature_log::warn!("Ignoring MEMCACHED_MAX_AWAY_TIME value {:?}: {}", away, e)
                }
            }
        }

        builder
    }

    /// Check the configuration can be used to build a client.
    pub fn validate(&self) -> io::Result<()> {
        if self.servers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one memcached server is required",
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "operation timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Add a server.
    pub fn server(mut self, addr: ServerAddr) -> Self {
        self.config.servers.push(addr);
        self
    }

    /// Replace the server list.
    pub fn servers(mut self, servers: impl IntoIterator<Item = ServerAddr>) -> Self {
        self.config.servers = servers.into_iter().collect();
        self
    }

    /// Enable or disable consistent hashing.
    pub fn consistent_hashing(mut self, enabled: bool) -> Self {
        self.config.consistent_hashing = enabled;
        self
    }

    /// Enable or disable the binary protocol.
    pub fn use_binary_protocol(mut self, enabled: bool) -> Self {
        self.config.use_binary_protocol = enabled;
        self
    }

    /// Set the per-operation timeout.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Set the maximum away time.
    pub fn max_away_time(mut self, away: Duration) -> Self {
        self.config.max_away_time = Some(away);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_server_addr() {
        let addr: ServerAddr = "memcache://localhost:11211".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("localhost", 11211));

        let addr: ServerAddr = "10.0.0.7:11212".parse().unwrap();
        assert_eq!(addr.host(), "10.0.0.7");
        assert_eq!(addr.port(), 11212);
        assert_eq!(addr.to_url(), "memcache://10.0.0.7:11212");

        assert!("invalid".parse::<ServerAddr>().is_err());
        assert!(":11211".parse::<ServerAddr>().is_err());
        assert!("host:port".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert!(!config.consistent_hashing);
        assert!(!config.use_binary_protocol);
        assert_eq!(config.operation_timeout, Duration::from_secs(1));
        assert_eq!(config.max_away_time, None);
    }

    #[test]
    fn test_builder() {
        let config = ConnectionConfig::builder()
            .server(ServerAddr::new("a", 11211))
            .server(ServerAddr::new("b", 11211))
            .consistent_hashing(true)
            .use_binary_protocol(true)
            .operation_timeout(Duration::from_millis(250))
            .max_away_time(Duration::from_secs(30))
            .build();

        assert_eq!(config.servers.len(), 2);
        assert!(config.consistent_hashing);
        assert!(config.use_binary_protocol);
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.max_away_time, Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_servers() {
        let err = ConnectionConfig::default().validate().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MEMCACHED_SERVERS", "cache1:11211, memcache://cache2:11212,bogus"),
            ("MEMCACHED_CONSISTENT_HASHING", "true"),
            ("MEMCACHED_OPERATION_TIMEOUT", "750ms"),
            ("MEMCACHED_MAX_AWAY_TIME", "1m"),
        ]
        .into_iter()
        .collect();

        let config = ConnectionConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).build();
        assert_eq!(
            config.servers,
            vec![ServerAddr::new("cache1", 11211), ServerAddr::new("cache2", 11212)]
        );
        assert!(config.consistent_hashing);
        assert!(!config.use_binary_protocol);
        assert_eq!(config.operation_timeout, Duration::from_millis(750));
        assert_eq!(config.max_away_time, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_lookup_warns_on_bad_durations() {
        let capture = armature_log::capture::LogCapture::start();
        let vars: HashMap<&str, &str> = [
            ("MEMCACHED_OPERATION_TIMEOUT", "soon"),
            ("MEMCACHED_MAX_AWAY_TIME", "-3 parsecs"),
        ]
        .into_iter()
        .collect();

        let config = ConnectionConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).build();
        assert_eq!(config.operation_timeout, Duration::from_secs(1));
        assert_eq!(config.max_away_time, None);
        assert!(capture.contains(
            armature_log::Level::Warn,
            "Ignoring MEMCACHED_OPERATION_TIMEOUT value \"soon\""
        ));
        assert!(capture.contains(
            armature_log::Level::Warn,
            "Ignoring MEMCACHED_MAX_AWAY_TIME value \"-3 parsecs\""
        ));
    }

    #[test]
    fn test_serde_roundtrip_uses_human_durations() {
        let config = ConnectionConfig::builder()
            .server(ServerAddr::new("localhost", 11211))
            .max_away_time(Duration::from_secs(5))
            .build();

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["servers"][0], "localhost:11211");
        assert_eq!(json["max_away_time"], "5s");

        let parsed: ConnectionConfig =
            serde_json::from_str(r#"{"servers":["h:1"],"operation_timeout":"2s"}"#).unwrap();
        assert_eq!(parsed.servers, vec![ServerAddr::new("h", 1)]);
        assert_eq!(parsed.operation_timeout, Duration::from_secs(2));
        assert_eq!(parsed.max_away_time, None);
    }
}
