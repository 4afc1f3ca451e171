//! Server configuration — all from environment variables.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for WebSocket + HTTP.
    pub listen_addr: String,
    /// Postgres connection string. Unset means the in-memory store.
    pub database_url: Option<String>,
    /// Pool size for the Postgres store.
    pub db_max_connections: u32,
    /// HMAC secret shared with the login service.
    pub jwt_secret: Option<String>,
    /// How long a new connection may take to authenticate.
    pub handshake_timeout: Duration,
    /// Upper bound on message content, in characters.
    pub max_message_len: usize,
    /// Parsed inbound events buffered per connection. When full, the
    /// connection stops reading from its socket.
    pub event_queue_len: usize,
    /// Origin allowed by CORS (the web front-end).
    pub cors_origin: String,
    /// Log level filter.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:2023".into()),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS").unwrap_or(20),
            jwt_secret: env::var("JWT_SECRET").ok().filter(|v| !v.is_empty()),
            handshake_timeout: Duration::from_secs(
                parse_var("HANDSHAKE_TIMEOUT_SECS").unwrap_or(10),
            ),
            max_message_len: parse_var("MAX_MESSAGE_LEN").unwrap_or(4000),
            event_queue_len: parse_var("EVENT_QUEUE_LEN").unwrap_or(32).max(1),
            cors_origin: env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "relayd=info,tower_http=info".into()),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
