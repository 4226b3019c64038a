//! memcache-check: a diagnostics check for memcached-compatible servers
//!
//! The check:
//! - Registers the target server with a cache client
//! - Fetches extended stats and measures the round trip
//! - Falls back to a plain connect when stats are inconclusive
//! - Reports success with latency, connections and uptime, or a failure message
//!
//! The client is injected, so the check can run against the built-in
//! text protocol [`TextClient`] or any other [`CacheClient`].

pub mod client;
pub mod config;
pub mod memcache;
pub mod outcome;
pub mod report;

pub use client::{CacheClient, ClientError, ClientFactory, ExtendedStats, ServerStats, TextClient};
pub use memcache::{CacheHealthCheck, CheckConfig, ConfigurationError};
pub use outcome::{Check, CheckOutcome, ServiceData};
pub use report::Report;
