//! Error types for the HTSP client.
//!
//! All fallible operations return `Result<T, HtspError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the HTSP client.
#[derive(Debug, Error)]
pub enum HtspError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// The byte stream violated the HTSP framing rules. Fatal for the
    /// connection that produced it; the supervisor may reconnect.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The server hostname did not resolve to any address.
    #[error("unresolved address: {0}")]
    UnresolvedAddress(String),

    // ── Dispatch Errors ──────────────────────────────────────────
    /// A send was attempted while the connection is not established.
    /// Returned to the caller; never fatal.
    #[error("not connected")]
    NotConnected,

    /// A reply did not arrive before the deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Protocol Errors ──────────────────────────────────────────
    /// The server denied access during the authentication handshake.
    #[error("authentication failed: access denied")]
    AuthFailed,

    /// A message was missing a required field or carried an
    /// unexpected value. The message is dropped, the connection
    /// continues.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for HtspError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        HtspError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = HtspError::Malformed("bad type byte");
        assert!(e.to_string().contains("bad type byte"));

        let e = HtspError::Timeout(Duration::from_millis(100));
        assert!(e.to_string().contains("100ms"));

        let e = HtspError::NotConnected;
        assert_eq!(e.to_string(), "not connected");
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: HtspError = io_err.into();
        assert!(matches!(e, HtspError::Io(_)));
    }
}
