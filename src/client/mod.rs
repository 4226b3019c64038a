//! Cache client capability consumed by the health check.
//!
//! The check never talks to the network itself. It asks a [`CacheClient`]
//! to register a server, fetch extended stats, and fall back to a plain
//! connect. Stats-fetch and connect both return `Result` so that a failed
//! call is an ordinary value the caller can interpret.
//!
//! ## Types
//!
//! - [`CacheClient`]: the capability contract
//! - [`ClientFactory`]: creates a fresh client per check invocation
//! - [`ExtendedStats`] / [`ServerStats`]: stats keyed by authority
//! - [`TextClient`]: memcached text protocol implementation

pub mod text;

pub use text::TextClient;

use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by a cache client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Stats were requested before any server was registered
    #[error("no memcache servers registered")]
    NoServers,

    /// Server address rejected at registration
    #[error("invalid memcache server {0}")]
    InvalidServer(String),

    /// Host name resolved to no usable address
    #[error("could not resolve memcache host {0}")]
    Resolve(String),

    /// Network failure
    #[error("memcache connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// Server sent something we could not understand
    #[error("memcache protocol error: {0}")]
    Protocol(String),
}

/// Format the `host:port` key used to index per-server stats.
pub fn authority(host: &str, port: i64) -> String {
    format!("{}:{}", host, port)
}

/// Statistics reported by a single server (`STAT <name> <value>` lines)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    values: HashMap<String, String>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw stat value, replacing any previous one
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Raw value of a stat
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Integer value of a stat, coerced with [`coerce_int`].
    ///
    /// A missing stat yields 0.
    pub fn int(&self, name: &str) -> i64 {
        self.get(name).map(coerce_int).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for ServerStats
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut stats = ServerStats::new();
        for (name, value) in iter {
            stats.insert(name, value);
        }
        stats
    }
}

/// Stats for every registered server, keyed by authority.
///
/// `None` marks a server that was registered but did not answer.
pub type ExtendedStats = HashMap<String, Option<ServerStats>>;

/// Parse the leading number of a string the way loosely typed callers expect:
/// `"42"` -> 42, `" 7abc"` -> 7, `"-3"` -> -3, `"1e3"` -> 1000,
/// `"12.9"` -> 12, `"abc"` -> 0.
///
/// A prefix with a fraction or exponent is read as a float and truncated.
/// Saturates at the `i64` bounds.
pub fn coerce_int(raw: &str) -> i64 {
    let trimmed = raw.trim_start();
    let bytes = trimmed.as_bytes();

    let digits_start = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_end = digits_start + count_digits(&bytes[digits_start..]);
    let mut end = int_end;
    let mut is_float = false;

    if bytes.get(end) == Some(&b'.') {
        let fraction = count_digits(&bytes[end + 1..]);
        if int_end > digits_start || fraction > 0 {
            end += 1 + fraction;
            is_float = true;
        }
    }

    if end > digits_start && matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let exponent_digits = count_digits(&bytes[exponent..]);
        if exponent_digits > 0 {
            end = exponent + exponent_digits;
            is_float = true;
        }
    }

    if is_float {
        // `as` saturates and maps NaN to 0
        return trimmed[..end].parse::<f64>().map(|f| f as i64).unwrap_or(0);
    }

    let negative = bytes.first() == Some(&b'-');
    let mut value: i64 = 0;
    for b in &bytes[digits_start..int_end] {
        let digit = i64::from(b - b'0');
        value = if negative {
            value.saturating_mul(10).saturating_sub(digit)
        } else {
            value.saturating_mul(10).saturating_add(digit)
        };
    }
    value
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// The cache client capability used by the health check
pub trait CacheClient {
    /// Register a server with this client
    fn add_server(&mut self, host: &str, port: i64) -> Result<(), ClientError>;

    /// Fetch stats from every registered server
    fn extended_stats(&mut self) -> Result<ExtendedStats, ClientError>;

    /// Open a connection to the given server
    fn connect(&mut self, host: &str, port: i64) -> Result<(), ClientError>;
}

impl<C: CacheClient + ?Sized> CacheClient for Box<C> {
    fn add_server(&mut self, host: &str, port: i64) -> Result<(), ClientError> {
        (**self).add_server(host, port)
    }

    fn extended_stats(&mut self) -> Result<ExtendedStats, ClientError> {
        (**self).extended_stats()
    }

    fn connect(&mut self, host: &str, port: i64) -> Result<(), ClientError> {
        (**self).connect(host, port)
    }
}

/// Creates a new client for each check invocation
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> Box<dyn CacheClient>;
}

impl<F, C> ClientFactory for F
where
    F: Fn() -> C + Send + Sync,
    C: CacheClient + 'static,
{
    fn create(&self) -> Box<dyn CacheClient> {
        Box::new(self())
    }
}
