//! Memcache health check.
//!
//! Verifies that a memcached-compatible server is reachable: fetch extended
//! stats for the configured server and, when they are inconclusive, fall back
//! to a plain connect before declaring the server down.

use crate::client::{self, coerce_int, ClientError, ClientFactory, TextClient};
use crate::outcome::{Check, CheckOutcome, ServiceData};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: i64 = 11211;
pub const DEFAULT_LABEL: &str = "Memcache";

/// Reported when no client capability was provided
pub const CLIENT_UNAVAILABLE: &str = "Memcache extension is not loaded";

/// Invalid check configuration, raised at construction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Cannot use {0} as host - expecting a string")]
    HostType(String),

    #[error("Cannot use an empty host")]
    EmptyHost,

    #[error("Invalid port number {0} - expecting a positive integer")]
    InvalidPort(i64),
}

/// Validated target of the check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConfig {
    host: String,
    port: i64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl CheckConfig {
    pub fn new(host: impl Into<String>, port: i64) -> Result<Self, ConfigurationError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigurationError::EmptyHost);
        }

        // Only the lower bound is checked; a port past the TCP range makes
        // every check fail instead
        if port < 1 {
            return Err(ConfigurationError::InvalidPort(port));
        }

        Ok(Self { host, port })
    }

    /// Build from loosely typed values, as found in a config file.
    ///
    /// The host must be a string. The port is coerced to an integer first:
    /// floats truncate, booleans become 0 or 1, strings use their leading
    /// integer and anything else becomes 0.
    pub fn from_values(host: &toml::Value, port: &toml::Value) -> Result<Self, ConfigurationError> {
        let host = match host {
            toml::Value::String(s) => s.clone(),
            other => return Err(ConfigurationError::HostType(other.type_str().to_string())),
        };

        Self::new(host, coerce_port(port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> i64 {
        self.port
    }

    /// `host:port` key of this server in extended stats
    pub fn authority(&self) -> String {
        client::authority(&self.host, self.port)
    }
}

fn coerce_port(value: &toml::Value) -> i64 {
    match value {
        toml::Value::Integer(i) => *i,
        toml::Value::Float(f) => f.trunc() as i64,
        toml::Value::Boolean(b) => i64::from(*b),
        toml::Value::String(s) => coerce_int(s),
        _ => 0,
    }
}

/// Checks that a memcache server is running and reports its stats
pub struct CacheHealthCheck {
    config: CheckConfig,
    label: String,
    clients: Option<Box<dyn ClientFactory>>,
}

impl Default for CacheHealthCheck {
    fn default() -> Self {
        Self::with_client(CheckConfig::default(), TextClient::default)
    }
}

impl fmt::Debug for CacheHealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHealthCheck")
            .field("config", &self.config)
            .field("label", &self.label)
            .field("client_available", &self.is_available())
            .finish()
    }
}

impl CacheHealthCheck {
    /// Check `host:port` using the built-in text protocol client
    pub fn new(host: impl Into<String>, port: i64) -> Result<Self, ConfigurationError> {
        Ok(Self::with_client(
            CheckConfig::new(host, port)?,
            TextClient::default,
        ))
    }

    /// Check with an injected client factory
    pub fn with_client<F>(config: CheckConfig, factory: F) -> Self
    where
        F: ClientFactory + 'static,
    {
        Self {
            config,
            label: DEFAULT_LABEL.to_string(),
            clients: Some(Box::new(factory)),
        }
    }

    /// Check with no client capability; every invocation fails without
    /// touching the network
    pub fn without_client(config: CheckConfig) -> Self {
        Self {
            config,
            label: DEFAULT_LABEL.to_string(),
            clients: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.clients.is_some()
    }

    fn query(&self, factory: &dyn ClientFactory) -> Result<CheckOutcome, ClientError> {
        let host = self.config.host();
        let port = self.config.port();

        let mut client = factory.create();
        client.add_server(host, port)?;

        let start = Instant::now();
        let extended = match client.extended_stats() {
            Ok(extended) => Some(extended),
            Err(e) => {
                debug!(error = %e, "Stats request failed");
                None
            }
        };
        let response_time = start.elapsed();

        let authority = self.config.authority();
        let stats = extended.and_then(|mut all| all.remove(&authority)).flatten();

        let data = match stats {
            Some(stats) => Some(ServiceData {
                response_time,
                connections: stats.int("curr_connections"),
                uptime: stats.int("uptime"),
            }),
            None => {
                debug!(server = %authority, "No stats for server, attempting direct connect");
                if let Err(e) = client.connect(host, port) {
                    debug!(server = %authority, error = %e, "Direct connect failed");
                    return Ok(CheckOutcome::failure(format!(
                        "No memcache server running at host {} on port {}",
                        host, port
                    )));
                }
                None
            }
        };

        Ok(CheckOutcome::success(
            format!("Memcache server running at host {} on port {}", host, port),
            data,
        ))
    }
}

impl Check for CacheHealthCheck {
    fn check(&self) -> CheckOutcome {
        let Some(factory) = self.clients.as_deref() else {
            warn!(label = %self.label, "{}", CLIENT_UNAVAILABLE);
            return CheckOutcome::failure(CLIENT_UNAVAILABLE);
        };

        debug!(label = %self.label, server = %self.config.authority(), "Running check");

        let outcome = self
            .query(factory)
            .unwrap_or_else(|e| CheckOutcome::failure(e.to_string()));

        match outcome.data() {
            Some(data) => info!(
                label = %self.label,
                response_time_ms = data.response_time.as_secs_f64() * 1000.0,
                connections = data.connections,
                uptime = data.uptime,
                "{}",
                outcome.message()
            ),
            None if outcome.is_success() => {
                info!(label = %self.label, "{} (no stats)", outcome.message())
            }
            None => warn!(label = %self.label, "{}", outcome.message()),
        }

        outcome
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CacheClient, ExtendedStats, ServerStats};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Scripted client recording every call made against it
    #[derive(Clone, Default)]
    struct MockClient {
        stats: Option<ExtendedStats>,
        connect_ok: bool,
        reject_server: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockClient {
        fn with_stats(stats: ExtendedStats) -> Self {
            Self {
                stats: Some(stats),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CacheClient for MockClient {
        fn add_server(&mut self, host: &str, port: i64) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(format!("add_server {host}:{port}"));
            if self.reject_server {
                return Err(ClientError::Resolve(host.to_string()));
            }
            Ok(())
        }

        fn extended_stats(&mut self) -> Result<ExtendedStats, ClientError> {
            self.calls.lock().unwrap().push("extended_stats".to_string());
            self.stats
                .clone()
                .ok_or_else(|| ClientError::Protocol("stats failed".to_string()))
        }

        fn connect(&mut self, host: &str, port: i64) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(format!("connect {host}:{port}"));
            if self.connect_ok {
                Ok(())
            } else {
                Err(ClientError::Io(std::io::ErrorKind::ConnectionRefused.into()))
            }
        }
    }

    fn server(values: &[(&str, &str)]) -> Option<ServerStats> {
        Some(values.iter().copied().collect())
    }

    fn check_with(host: &str, port: i64, mock: &MockClient) -> CacheHealthCheck {
        let mock = mock.clone();
        CacheHealthCheck::with_client(CheckConfig::new(host, port).unwrap(), move || mock.clone())
    }

    #[test]
    fn test_default_config() {
        let check = CacheHealthCheck::default();
        assert_eq!(check.config().host(), "127.0.0.1");
        assert_eq!(check.config().port(), 11211);
        assert_eq!(check.label(), "Memcache");
        assert!(check.is_available());
    }

    #[test]
    fn test_new_stores_values() {
        let check = CacheHealthCheck::new("cache1", 1).unwrap();
        assert_eq!(check.config().host(), "cache1");
        assert_eq!(check.config().port(), 1);

        let check = CacheHealthCheck::new("10.0.0.5", 65535).unwrap();
        assert_eq!(check.config().authority(), "10.0.0.5:65535");
    }

    #[test]
    fn test_invalid_port() {
        for port in [0, -1, -11211, i64::MIN] {
            assert_eq!(
                CheckConfig::new("cache1", port),
                Err(ConfigurationError::InvalidPort(port))
            );
        }
    }

    #[test]
    fn test_port_above_tcp_range_is_stored() {
        for port in [65536, 70000, i64::MAX] {
            let config = CheckConfig::new("cache1", port).unwrap();
            assert_eq!(config.port(), port);
            assert_eq!(config.authority(), format!("cache1:{port}"));
        }
    }

    #[test]
    fn test_port_above_tcp_range_fails_check() {
        let check = CacheHealthCheck::new("127.0.0.1", 70000).unwrap();
        assert_eq!(
            check.check(),
            CheckOutcome::failure("No memcache server running at host 127.0.0.1 on port 70000")
        );
    }

    #[test]
    fn test_empty_host() {
        assert_eq!(CheckConfig::new("", 11211), Err(ConfigurationError::EmptyHost));
    }

    #[test]
    fn test_from_values_rejects_non_string_host() {
        let port = toml::Value::Integer(11211);
        for host in [
            toml::Value::Integer(127),
            toml::Value::Float(1.5),
            toml::Value::Boolean(true),
            toml::Value::Array(vec![]),
        ] {
            match CheckConfig::from_values(&host, &port) {
                Err(ConfigurationError::HostType(kind)) => assert_eq!(kind, host.type_str()),
                other => panic!("Expected HostType error, got {other:?}"),
            }
        }

        let err = CheckConfig::from_values(&toml::Value::Integer(1), &port).unwrap_err();
        assert_eq!(err.to_string(), "Cannot use integer as host - expecting a string");
    }

    #[test]
    fn test_from_values_coerces_port() {
        let host = toml::Value::String("cache1".to_string());

        let config = CheckConfig::from_values(&host, &toml::Value::String("11211".into())).unwrap();
        assert_eq!(config.port(), 11211);

        let config = CheckConfig::from_values(&host, &toml::Value::Float(11211.9)).unwrap();
        assert_eq!(config.port(), 11211);

        let config = CheckConfig::from_values(&host, &toml::Value::Boolean(true)).unwrap();
        assert_eq!(config.port(), 1);

        for port in [
            toml::Value::String("abc".into()),
            toml::Value::Float(0.5),
            toml::Value::Boolean(false),
            toml::Value::Integer(-5),
        ] {
            assert!(matches!(
                CheckConfig::from_values(&host, &port),
                Err(ConfigurationError::InvalidPort(_))
            ));
        }

        let err = CheckConfig::from_values(&host, &toml::Value::Integer(0)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid port number 0 - expecting a positive integer"
        );
    }

    #[test]
    fn test_client_unavailable() {
        let check = CacheHealthCheck::without_client(CheckConfig::new("127.0.0.1", 11211).unwrap());
        assert!(!check.is_available());
        assert_eq!(
            check.check(),
            CheckOutcome::failure("Memcache extension is not loaded")
        );
    }

    #[test]
    fn test_client_unavailable_creates_no_client() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            MockClient::default()
        };

        let check = CacheHealthCheck::without_client(CheckConfig::default());
        check.check();
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let check = CacheHealthCheck::with_client(CheckConfig::default(), factory);
        check.check();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_success_with_stats() {
        let mock = MockClient::with_stats(ExtendedStats::from([(
            "cache1:11211".to_string(),
            server(&[("curr_connections", "5"), ("uptime", "120")]),
        )]));
        let check = check_with("cache1", 11211, &mock);

        match check.check() {
            CheckOutcome::Success {
                message,
                data: Some(data),
            } => {
                assert_eq!(message, "Memcache server running at host cache1 on port 11211");
                assert!(data.response_time >= Duration::ZERO);
                assert!(data.response_time_secs() >= 0.0);
                assert_eq!(data.connections, 5);
                assert_eq!(data.uptime, 120);
            }
            other => panic!("Expected Success with data, got {other:?}"),
        }

        assert_eq!(mock.calls(), vec!["add_server cache1:11211", "extended_stats"]);
    }

    #[test]
    fn test_stats_values_are_coerced() {
        let mock = MockClient::with_stats(ExtendedStats::from([(
            "cache1:11211".to_string(),
            server(&[("curr_connections", "7 conns"), ("version", "1.6.21")]),
        )]));
        let check = check_with("cache1", 11211, &mock);

        let outcome = check.check();
        let data = outcome.data().expect("metadata");
        assert_eq!(data.connections, 7);
        assert_eq!(data.uptime, 0);
    }

    #[test]
    fn test_stats_failed_and_connect_failed() {
        let mock = MockClient::default();
        let check = check_with("deadhost", 11211, &mock);

        assert_eq!(
            check.check(),
            CheckOutcome::failure("No memcache server running at host deadhost on port 11211")
        );
        assert_eq!(
            mock.calls(),
            vec![
                "add_server deadhost:11211",
                "extended_stats",
                "connect deadhost:11211"
            ]
        );
    }

    #[test]
    fn test_stats_failed_but_connect_succeeds() {
        let mock = MockClient {
            connect_ok: true,
            ..Default::default()
        };
        let check = check_with("cache1", 11211, &mock);

        assert_eq!(
            check.check(),
            CheckOutcome::success("Memcache server running at host cache1 on port 11211", None)
        );
    }

    #[test]
    fn test_authority_missing_from_stats() {
        let mut mock = MockClient::with_stats(ExtendedStats::from([(
            "other:11211".to_string(),
            server(&[("curr_connections", "5"), ("uptime", "120")]),
        )]));
        let check = check_with("cache1", 11211, &mock);
        assert_eq!(
            check.check(),
            CheckOutcome::failure("No memcache server running at host cache1 on port 11211")
        );

        mock.connect_ok = true;
        let check = check_with("cache1", 11211, &mock);
        let outcome = check.check();
        assert!(outcome.is_success());
        assert_eq!(outcome.data(), None);
    }

    #[test]
    fn test_server_marked_unavailable() {
        let mock = MockClient::with_stats(ExtendedStats::from([("cache1:11211".to_string(), None)]));
        let check = check_with("cache1", 11211, &mock);

        assert_eq!(
            check.check(),
            CheckOutcome::failure("No memcache server running at host cache1 on port 11211")
        );
        assert!(mock.calls().contains(&"connect cache1:11211".to_string()));
    }

    #[test]
    fn test_client_error_becomes_failure() {
        let mock = MockClient {
            reject_server: true,
            ..Default::default()
        };
        let check = check_with("nowhere.invalid", 11211, &mock);

        assert_eq!(
            check.check(),
            CheckOutcome::failure("could not resolve memcache host nowhere.invalid")
        );
        assert_eq!(mock.calls(), vec!["add_server nowhere.invalid:11211"]);
    }

    #[test]
    fn test_each_check_creates_fresh_client() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let check = CacheHealthCheck::with_client(CheckConfig::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            MockClient {
                connect_ok: true,
                ..Default::default()
            }
        });

        check.check();
        check.check();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_with_label() {
        let check = CacheHealthCheck::default().with_label("Session cache");
        assert_eq!(check.label(), "Session cache");
    }

    #[test]
    fn test_end_to_end_with_text_client() {
        use std::io::{Read, Write};
        use std::net::TcpListener;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut chunk = [0u8; 64];
            let mut request = Vec::new();
            while !request.ends_with(b"stats\r\n") {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
            }
            stream
                .write_all(b"STAT pid 1\r\nSTAT uptime 86400\r\nSTAT curr_connections 12\r\nEND\r\n")
                .unwrap();
            while let Ok(n) = stream.read(&mut chunk) {
                if n == 0 {
                    break;
                }
            }
        });

        let check = CacheHealthCheck::new("127.0.0.1", i64::from(port)).unwrap();
        let outcome = check.check();

        assert_eq!(
            outcome.message(),
            format!("Memcache server running at host 127.0.0.1 on port {port}")
        );
        let data = outcome.data().expect("metadata");
        assert_eq!(data.connections, 12);
        assert_eq!(data.uptime, 86400);
    }

    #[test]
    fn test_end_to_end_server_down() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let check = CacheHealthCheck::with_client(
            CheckConfig::new("127.0.0.1", i64::from(port)).unwrap(),
            || TextClient::new(Duration::from_millis(200)),
        );

        assert_eq!(
            check.check(),
            CheckOutcome::failure(format!(
                "No memcache server running at host 127.0.0.1 on port {port}"
            ))
        );
    }
}
