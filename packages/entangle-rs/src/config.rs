use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::bus::DEFAULT_FAILURE_CAPACITY;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::http_adapter::{HttpConfig, DEFAULT_HTTP_TIMEOUT};

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub history_capacity: usize,
    pub handler_timeout: Option<Duration>,
    pub failure_channel_capacity: usize,
    pub http_base_url: Option<String>,
    pub http_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            history_capacity: match lookup("ENTANGLE_HISTORY_CAPACITY") {
                Some(v) => v
                    .parse()
                    .context("ENTANGLE_HISTORY_CAPACITY must be a valid number")?,
                None => DEFAULT_HISTORY_CAPACITY,
            },
            handler_timeout: lookup("ENTANGLE_HANDLER_TIMEOUT_MS")
                .map(|v| v.parse().map(Duration::from_millis))
                .transpose()
                .context("ENTANGLE_HANDLER_TIMEOUT_MS must be a number of milliseconds")?,
            failure_channel_capacity: match lookup("ENTANGLE_FAILURE_CHANNEL_CAPACITY") {
                Some(v) => v
                    .parse()
                    .context("ENTANGLE_FAILURE_CHANNEL_CAPACITY must be a valid number")?,
                None => DEFAULT_FAILURE_CAPACITY,
            },
            http_base_url: lookup("ENTANGLE_HTTP_BASE_URL").filter(|v| !v.is_empty()),
            http_timeout: match lookup("ENTANGLE_HTTP_TIMEOUT_MS") {
                Some(v) => Duration::from_millis(
                    v.parse()
                        .context("ENTANGLE_HTTP_TIMEOUT_MS must be a number of milliseconds")?,
                ),
                None => DEFAULT_HTTP_TIMEOUT,
            },
        })
    }

    /// Settings for the default HTTP adapter
    pub fn http(&self) -> HttpConfig {
        HttpConfig {
            base_url: self.http_base_url.clone(),
            timeout: self.http_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            handler_timeout: None,
            failure_channel_capacity: DEFAULT_FAILURE_CAPACITY,
            http_base_url: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}
