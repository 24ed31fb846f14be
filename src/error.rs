//! Error types for newsweave
//!
//! A single crate-wide [`Error`] covers every layer of the client:
//! - Wire level failures (protocol status codes, transport, timeouts, framing)
//! - Pipeline level failures (segment fetches, exhausted repair capacity)
//! - Ambient failures (configuration, I/O, manifest retrieval, external tools)

use std::time::Duration;
use thiserror::Error;

/// Result type alias for newsweave operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for newsweave
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered with a status code of 400 or higher
    #[error("protocol error {code}: {message}")]
    Protocol {
        /// Three digit status code
        code: u16,
        /// Status message as sent by the server
        message: String,
    },

    /// Socket failed or was closed while an exchange was in flight
    #[error("transport error: {0}")]
    Transport(String),

    /// No complete response arrived within the command bound
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed status line or frame
    #[error("parse error: {0}")]
    Parse(String),

    /// A segment body could not be fetched
    #[error("failed to fetch segment {id}: {reason}")]
    SegmentFetch {
        /// Segment message id
        id: String,
        /// Underlying failure
        reason: String,
    },

    /// More segments are broken than the repair files can restore
    #[error("repair exhausted: {0}")]
    RepairExhausted(String),

    /// The request was withdrawn before it was served
    #[error("cancelled")]
    Cancelled,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "server.host")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error while retrieving a manifest
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Manifest could not be parsed or contains nothing usable
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// External tool execution failed (par2)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, missing capability)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Protocol status code carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for failures that ended the underlying connection
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub(crate) fn config(message: impl Into<String>, key: &str) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
