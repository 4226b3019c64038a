//! Memcached text protocol client.
//!
//! Speaks just enough of the text protocol to serve the health check:
//!
//! ```text
//! Request:  stats\r\n
//! Response: STAT pid 1234\r\n
//!           STAT uptime 120\r\n
//!           ...
//!           END\r\n
//! ```
//!
//! Every call opens its own blocking TCP connection, bounded by the client
//! timeout for connect, read and write.

use super::{authority, CacheClient, ClientError, ExtendedStats, ServerStats};
use bytes::BytesMut;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::str;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Timeout applied when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a stats response before we give up on the server
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Stats response parsing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Line is not valid UTF-8
    #[error("invalid UTF-8 in response")]
    InvalidUtf8,
    /// Server rejected the request
    #[error("server replied {0}")]
    ServerError(String),
    /// Line is neither a STAT line nor END
    #[error("unexpected response line: {0}")]
    UnexpectedLine(String),
}

/// Result of parsing a stats response
#[derive(Debug)]
pub enum ParseResult {
    /// Response ended with END, with bytes consumed
    Complete(ServerStats, usize),
    /// Need more data
    Incomplete,
    /// Malformed or error response
    Error(ParseError),
}

/// Parse a complete `stats` response from the buffer.
pub fn parse_stats(buffer: &[u8]) -> ParseResult {
    let mut stats = ServerStats::new();
    let mut offset = 0;

    while let Some(line_end) = find_crlf(&buffer[offset..]) {
        let line = match str::from_utf8(&buffer[offset..offset + line_end]) {
            Ok(s) => s,
            Err(_) => return ParseResult::Error(ParseError::InvalidUtf8),
        };
        offset += line_end + 2;

        if line == "END" {
            return ParseResult::Complete(stats, offset);
        }

        if let Some(rest) = line.strip_prefix("STAT ") {
            match rest.split_once(' ') {
                Some((name, value)) => stats.insert(name, value.trim()),
                None => stats.insert(rest, ""),
            }
            continue;
        }

        if line == "ERROR"
            || line.starts_with("CLIENT_ERROR")
            || line.starts_with("SERVER_ERROR")
        {
            return ParseResult::Error(ParseError::ServerError(line.to_string()));
        }

        return ParseResult::Error(ParseError::UnexpectedLine(line.to_string()));
    }

    ParseResult::Incomplete
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Blocking memcached client used by the health check
#[derive(Debug, Clone)]
pub struct TextClient {
    servers: Vec<(String, i64)>,
    timeout: Duration,
}

impl Default for TextClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TextClient {
    /// Create a client with the given I/O timeout.
    ///
    /// A zero timeout falls back to [`DEFAULT_TIMEOUT`], since sockets reject it.
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };

        Self {
            servers: Vec::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registered servers in registration order
    pub fn servers(&self) -> &[(String, i64)] {
        &self.servers
    }

    /// Open a TCP connection, trying each resolved address in turn
    fn open(&self, host: &str, port: i64) -> Result<TcpStream, ClientError> {
        let tcp_port = match u16::try_from(port) {
            Ok(p) if p >= 1 => p,
            _ => return Err(ClientError::InvalidServer(authority(host, port))),
        };

        let addrs: Vec<SocketAddr> = (host, tcp_port).to_socket_addrs()?.collect();
        let mut last_error = None;

        for addr in addrs {
            trace!(%addr, "Connecting");
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(ClientError::Io(e)),
            None => Err(ClientError::Resolve(host.to_string())),
        }
    }

    /// Request stats from a single server
    fn fetch_stats(&self, host: &str, port: i64) -> Result<ServerStats, ClientError> {
        let mut stream = self.open(host, port)?;
        stream.write_all(b"stats\r\n")?;

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let mut chunk = [0u8; BUFFER_SIZE];
        // Start of the first line not yet scanned
        let mut scanned = 0;

        loop {
            // Any line other than STAT ends the response: END, an error, or garbage
            while let Some(line_end) = find_crlf(&buffer[scanned..]) {
                let line_start = scanned;
                scanned += line_end + 2;

                if !buffer[line_start..line_start + line_end].starts_with(b"STAT ") {
                    return match parse_stats(&buffer) {
                        ParseResult::Complete(stats, consumed) => {
                            if consumed < buffer.len() {
                                trace!(
                                    trailing = buffer.len() - consumed,
                                    "Ignoring bytes after END"
                                );
                            }
                            // Polite close; the server may already be gone
                            let _ = stream.write_all(b"quit\r\n");
                            Ok(stats)
                        }
                        ParseResult::Error(e) => Err(ClientError::Protocol(e.to_string())),
                        ParseResult::Incomplete => Err(ClientError::Protocol(
                            "incomplete stats response".to_string(),
                        )),
                    };
                }
            }

            if buffer.len() > MAX_RESPONSE_BYTES {
                return Err(ClientError::Protocol(format!(
                    "stats response exceeds {} bytes",
                    MAX_RESPONSE_BYTES
                )));
            }

            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClientError::Protocol(
                    "connection closed before END".to_string(),
                ));
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

impl CacheClient for TextClient {
    /// Register a server.
    ///
    /// Ports beyond the TCP range are accepted here and fail when used.
    fn add_server(&mut self, host: &str, port: i64) -> Result<(), ClientError> {
        if host.is_empty() || port < 1 {
            return Err(ClientError::InvalidServer(authority(host, port)));
        }

        if !self.servers.iter().any(|(h, p)| h == host && *p == port) {
            self.servers.push((host.to_string(), port));
        }
        Ok(())
    }

    fn extended_stats(&mut self) -> Result<ExtendedStats, ClientError> {
        if self.servers.is_empty() {
            return Err(ClientError::NoServers);
        }

        let mut extended = ExtendedStats::with_capacity(self.servers.len());
        for (host, port) in &self.servers {
            let key = authority(host, *port);
            match self.fetch_stats(host, *port) {
                Ok(stats) => {
                    debug!(server = %key, count = stats.len(), "Fetched stats");
                    extended.insert(key, Some(stats));
                }
                Err(e) => {
                    debug!(server = %key, error = %e, "Stats unavailable");
                    extended.insert(key, None);
                }
            }
        }

        Ok(extended)
    }

    fn connect(&mut self, host: &str, port: i64) -> Result<(), ClientError> {
        let stream = self.open(host, port)?;
        debug!(server = %authority(host, port), "Connected");
        drop(stream);
        Ok(())
    }
}
