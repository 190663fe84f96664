//! Runtime configuration
//!
//! Read once at startup from the command line and environment.

use std::time::Duration;

use tracing::warn;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

const DEFAULT_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Per-connection limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages queued for a session before it is treated as stalled
    pub outbound_buffer: usize,
    /// Upper bound on a single write to a session's socket
    pub write_timeout: Duration,
    /// How long a new connection has to send its username
    pub handshake_timeout: Duration,
    /// Longest inbound line accepted, in bytes, including the newline
    pub max_line_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Bind address: first CLI argument, then `CHAT_ADDR`, then the default.
    pub fn from_env() -> Self {
        let addr = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("CHAT_ADDR").ok())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());

        let session = SessionConfig {
            outbound_buffer: env_parse("CHAT_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER).max(1),
            write_timeout: Duration::from_secs(env_parse(
                "CHAT_WRITE_TIMEOUT_SECS",
                DEFAULT_WRITE_TIMEOUT_SECS,
            )),
            handshake_timeout: Duration::from_secs(env_parse(
                "CHAT_HANDSHAKE_TIMEOUT_SECS",
                DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            )),
            max_line_len: env_parse("CHAT_MAX_LINE_LEN", DEFAULT_MAX_LINE_LEN).max(1),
        };

        Self { addr, session }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T>(key: &str, raw: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    raw.trim().parse().unwrap_or_else(|_| {
        warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
        default
    })
}
