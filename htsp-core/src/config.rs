//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::ExponentialBackoff;

/// Everything needed to reach and authenticate against one TVHeadend
/// server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server hostname or IP address.
    pub hostname: String,
    /// HTSP binary port.
    pub port: u16,
    /// Account username.
    pub username: String,
    /// Account password (digested, never sent in the clear).
    pub password: String,
    /// Client name advertised in the `hello` request.
    pub client_name: String,
    /// Client version advertised in the `hello` request.
    pub client_version: String,
    /// Protocol version advertised in the `hello` request.
    pub htsp_version: i64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout for synchronous request/reply calls in milliseconds.
    pub reply_timeout_ms: u64,
    /// Reconnect backoff tuning.
    pub backoff: BackoffConfig,
}

/// Reconnect backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay between reconnect attempts in milliseconds.
    pub initial_ms: u64,
    /// Cap on the delay in milliseconds.
    pub max_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,
    /// Maximum random jitter added to each delay in milliseconds.
    pub jitter_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            port: 9982,
            username: String::new(),
            password: String::new(),
            client_name: "htsp-core".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            htsp_version: 26,
            connect_timeout_ms: 5000,
            reply_timeout_ms: 5000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 30_000,
            factor: 2.0,
            jitter_ms: 250,
        }
    }
}

impl ClientConfig {
    /// The `"host:port"` string for connecting.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl BackoffConfig {
    /// Build the backoff state machine for one supervisor run.
    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_ms),
            Duration::from_millis(self.max_ms),
            self.factor,
            self.jitter_ms,
            true,
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────
