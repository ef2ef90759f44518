use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::MAX_WEIGHT;

/// Where a memcached server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    Tcp(String),
    Unix(String),
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp(addr) => write!(f, "{addr}"),
            ServerAddr::Unix(path) => write!(f, "unix:{path}"),
        }
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match parse_server(s)? {
            (addr, 1) => Ok(addr),
            _ => Err(Error::Config(format!(
                "{s:?} carries a weight, expected a bare address"
            ))),
        }
    }
}

/// One entry of the `servers` list: either `"host:port[:weight]"`,
/// `"unix:/path"` / `"/path"`, or an `(address, weight)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServerSpec {
    Address(String),
    Weighted(String, u32),
}

impl ServerSpec {
    /// Resolves the entry into an address and a weight (default 1).
    pub fn parse(&self) -> Result<(ServerAddr, u32)> {
        match self {
            ServerSpec::Address(s) => parse_server(s),
            ServerSpec::Weighted(s, weight) => {
                let addr = s.parse::<ServerAddr>()?;
                Ok((addr, check_weight(s, *weight)?))
            }
        }
    }
}

impl From<&str> for ServerSpec {
    fn from(s: &str) -> Self {
        ServerSpec::Address(s.to_string())
    }
}

impl From<String> for ServerSpec {
    fn from(s: String) -> Self {
        ServerSpec::Address(s)
    }
}

impl From<(&str, u32)> for ServerSpec {
    fn from((s, weight): (&str, u32)) -> Self {
        ServerSpec::Weighted(s.to_string(), weight)
    }
}

fn parse_server(s: &str) -> Result<(ServerAddr, u32)> {
    let s = s.trim();
    if let Some(path) = s.strip_prefix("unix:") {
        return unix_addr(s, path);
    }
    if s.starts_with('/') {
        return unix_addr(s, s);
    }

    let bad = || Error::Config(format!("cannot parse server address {s:?}"));
    let (host, rest) = match s.strip_prefix('[') {
        Some(bracketed) => {
            let end = bracketed.find(']').ok_or_else(bad)?;
            let rest = bracketed[end + 1..].strip_prefix(':').ok_or_else(bad)?;
            (&s[..end + 2], rest)
        }
        None => s.split_once(':').ok_or_else(bad)?,
    };
    if host.is_empty() {
        return Err(bad());
    }

    let (port, weight) = match rest.split_once(':') {
        Some((port, weight)) => (port, weight.parse::<u32>().map_err(|_| bad())?),
        None => (rest, 1),
    };
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((ServerAddr::Tcp(format!("{host}:{port}")), check_weight(s, weight)?))
}

fn check_weight(s: &str, weight: u32) -> Result<u32> {
    if weight == 0 || weight > MAX_WEIGHT {
        return Err(Error::Config(format!(
            "server {s:?} has weight {weight}, expected 1..={MAX_WEIGHT}"
        )));
    }
    Ok(weight)
}

fn unix_addr(s: &str, path: &str) -> Result<(ServerAddr, u32)> {
    if path.is_empty() {
        return Err(Error::Config(format!("empty unix socket path in {s:?}")));
    }
    Ok((ServerAddr::Unix(path.to_string()), 1))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub servers: Vec<ServerSpec>,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_dead_retry_interval_ms")]
    pub dead_retry_interval_ms: u64,
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "default_max_connections_per_server")]
    pub max_connections_per_server: usize,
    #[serde(default)]
    pub noreply: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_socket_timeout_ms() -> u64 {
    3_000
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_dead_retry_interval_ms() -> u64 {
    30_000
}
fn default_max_value_size() -> usize {
    1024 * 1024
}
fn default_compression_threshold() -> usize {
    128 * 1024
}
fn default_max_connections_per_server() -> usize {
    16
}

impl ClientConfig {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServerSpec>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            socket_timeout_ms: default_socket_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            dead_retry_interval_ms: default_dead_retry_interval_ms(),
            max_value_size: default_max_value_size(),
            compression_threshold: default_compression_threshold(),
            max_connections_per_server: default_max_connections_per_server(),
            noreply: false,
            debug: false,
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&contents)
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn dead_retry_interval(mut self, interval: Duration) -> Self {
        self.dead_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    pub fn max_connections_per_server(mut self, n: usize) -> Self {
        self.max_connections_per_server = n;
        self
    }

    pub fn noreply(mut self, noreply: bool) -> Self {
        self.noreply = noreply;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub(crate) fn socket_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub(crate) fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn dead_retry_duration(&self) -> Duration {
        Duration::from_millis(self.dead_retry_interval_ms)
    }

    /// Parses every server entry, rejecting an empty or malformed list.
    pub fn parse_servers(&self) -> Result<Vec<(ServerAddr, u32)>> {
        if self.servers.is_empty() {
            return Err(Error::Config("no servers configured".to_string()));
        }
        let servers = self
            .servers
            .iter()
            .map(ServerSpec::parse)
            .collect::<Result<Vec<_>>>()?;
        for (i, (addr, _)) in servers.iter().enumerate() {
            if servers[..i].iter().any(|(other, _)| other == addr) {
                return Err(Error::Config(format!("server {addr} listed twice")));
            }
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server() {
        assert_eq!(
            parse_server("127.0.0.1:11211").unwrap(),
            (ServerAddr::Tcp("127.0.0.1:11211".to_string()), 1)
        );
        assert_eq!(
            parse_server("cache-a:11211:3").unwrap(),
            (ServerAddr::Tcp("cache-a:11211".to_string()), 3)
        );
        assert_eq!(
            parse_server("[::1]:11211:2").unwrap(),
            (ServerAddr::Tcp("[::1]:11211".to_string()), 2)
        );
        assert_eq!(
            parse_server("unix:/tmp/memcached.sock").unwrap(),
            (ServerAddr::Unix("/tmp/memcached.sock".to_string()), 1)
        );
        assert_eq!(
            parse_server("/tmp/memcached.sock").unwrap(),
            (ServerAddr::Unix("/tmp/memcached.sock".to_string()), 1)
        );

        assert!(parse_server("localhost").is_err());
        assert!(parse_server(":11211").is_err());
        assert!(parse_server("localhost:port").is_err());
        assert!(parse_server("localhost:11211:0").is_err());
        assert!(parse_server("[::1:11211").is_err());
        assert!(parse_server("unix:").is_err());
    }

    #[test]
    fn test_server_spec() {
        let spec = ServerSpec::from(("10.0.0.1:11211", 4));
        assert_eq!(
            spec.parse().unwrap(),
            (ServerAddr::Tcp("10.0.0.1:11211".to_string()), 4)
        );
        assert!(ServerSpec::from(("10.0.0.1:11211", 0)).parse().is_err());
        assert!(ServerSpec::from(("10.0.0.1:11211", MAX_WEIGHT)).parse().is_ok());
        assert!(matches!(
            ServerSpec::from(("10.0.0.1:11211", MAX_WEIGHT + 1)).parse(),
            Err(Error::Config(_))
        ));
        assert!(ServerSpec::from(("10.0.0.1:11211:2", 4)).parse().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["127.0.0.1:11211", "unix:/tmp/mc.sock"] {
            assert_eq!(s.parse::<ServerAddr>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new(["127.0.0.1:11211"]);
        assert_eq!(config.socket_timeout_duration(), Duration::from_secs(3));
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(3));
        assert_eq!(config.dead_retry_duration(), Duration::from_secs(30));
        assert_eq!(config.max_value_size, 1024 * 1024);
        assert_eq!(config.compression_threshold, 128 * 1024);
        assert!(!config.noreply);
        assert!(!config.debug);
    }

    #[test]
    fn test_from_yaml() {
        let config = ClientConfig::from_yaml_str(
            r#"
servers:
  - "10.0.0.1:11211"
  - "10.0.0.2:11211:2"
  - ["10.0.0.3:11211", 3]
socket_timeout_ms: 500
debug: true
"#,
        )
        .unwrap();
        assert_eq!(config.socket_timeout_duration(), Duration::from_millis(500));
        assert_eq!(config.dead_retry_interval_ms, 30_000);
        assert!(config.debug);

        let servers = config.parse_servers().unwrap();
        let weights: Vec<u32> = servers.iter().map(|(_, w)| *w).collect();
        assert_eq!(weights, vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_servers_rejects() {
        let empty: [&str; 0] = [];
        assert!(ClientConfig::new(empty).parse_servers().is_err());
        assert!(
            ClientConfig::new(["a:1", "a:1:2"])
                .parse_servers()
                .is_err()
        );
        assert!(ClientConfig::from_yaml_str("socket_timeout_ms: 1").is_err());
        assert!(matches!(
            ClientConfig::new(["10.0.0.1:11211:30000000"]).parse_servers(),
            Err(Error::Config(_))
        ));
    }
}
