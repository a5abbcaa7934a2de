//! Configuration for the duplex client

use crate::error::{DuplexError, Result};
use std::time::Duration;
use uuid::Uuid;

/// Query parameter carrying the session identity on the connection URL
pub const IDENTITY_PARAM: &str = "uuid";

/// Configuration for connecting to a duplex endpoint
#[derive(Debug, Clone)]
pub struct DuplexConfig {
    /// Endpoint URL (e.g., "ws://localhost:8080/ws")
    pub url: String,

    /// Session identity appended to the URL; generated when absent
    pub identity: Option<String>,

    /// Log payload-level diagnostics
    pub debug: bool,

    /// Whether to automatically reconnect on disconnect
    pub auto_reconnect: bool,

    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,

    /// Give up after this many failed attempts (None retries forever)
    pub max_reconnect_attempts: Option<u32>,

    /// Timeout for a single transport handshake
    pub connect_timeout: Duration,

    /// Abandon requests that get no response within this time (None waits forever)
    pub request_timeout: Option<Duration>,

    /// Role prefix used for task names in role-prefixed calls
    pub role: String,
}

impl DuplexConfig {
    /// Create a new configuration for the given endpoint URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            identity: None,
            debug: false,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            role: "open".to_string(),
        }
    }

    /// Build a configuration from `DUPLEX_*` environment variables
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("DUPLEX_URL")
            .map_err(|_| DuplexError::InvalidEndpoint("DUPLEX_URL not set".into()))?;

        let mut config = Self::new(url);
        config.identity = std::env::var("DUPLEX_IDENTITY").ok();
        config.debug = std::env::var("DUPLEX_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Some(secs) = env_parse::<u64>("DUPLEX_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(secs);
        }
        // 0 keeps the unbounded default
        config.max_reconnect_attempts =
            env_parse::<u32>("DUPLEX_MAX_RECONNECT").filter(|n| *n > 0);
        config.request_timeout =
            env_parse::<u64>("DUPLEX_REQUEST_TIMEOUT_SECS").map(Duration::from_secs);

        Ok(config)
    }

    /// Set the session identity sent as the `uuid` query parameter
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Enable payload-level diagnostics
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the delay between reconnection attempts
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Cap the number of consecutive reconnection attempts
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Set the handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Abandon requests that are not answered in time
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the role prefix for task names
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Fill in a random identity if none was configured, returning it
    pub(crate) fn ensure_identity(&mut self) -> &str {
        self.identity
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .as_str()
    }

    /// The URL actually dialed: the endpoint plus the identity parameter
    pub fn endpoint_url(&self) -> Result<String> {
        let url = self.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(DuplexError::InvalidEndpoint(self.url.clone()));
        }

        match &self.identity {
            Some(identity) => {
                let sep = if url.contains('?') { '&' } else { '?' };
                Ok(format!("{url}{sep}{IDENTITY_PARAM}={identity}"))
            }
            None => Ok(url.to_string()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
