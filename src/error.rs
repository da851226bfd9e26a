//! Error types for tether.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! Fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```no_run
//! use tether::{Options, Result};
//!
//! # async fn example() -> Result<()> {
//! let (conn, mut events) = tether::open("example.com", 443, Options::default())?;
//! let stream = conn.get("/", Vec::<(String, String)>::new());
//! # Ok(())
//! # }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Validation | [`Error::InvalidOption`] |
//! | Connection | [`Error::Connection`], [`Error::Tls`], [`Error::ConnectionClosed`], [`Error::RetriesExhausted`] |
//! | Usage | [`Error::BadState`] |
//! | Protocol | [`Error::Protocol`] |
//! | Internal | [`Error::Internal`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// An option passed to `open` is unknown or out of range.
    ///
    /// No connection is started when this is returned.
    #[error("Invalid option `{option}`: {message}")]
    InvalidOption {
        /// Name of the offending option.
        option: String,
        /// Why the option was rejected.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// TCP connection could not be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// TLS configuration or handshake failed.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS error.
        message: String,
    },

    /// The socket is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every connect attempt in the retry budget failed.
    ///
    /// Fatal: the connection actor terminates after reporting this.
    #[error("Gave up connecting to {host}:{port} after {attempts} attempts")]
    RetriesExhausted {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Number of connect attempts made.
        attempts: u32,
    },

    // ========================================================================
    // Usage Errors
    // ========================================================================
    /// Operation is not valid in the connection's current mode.
    #[error("Bad state: {message}")]
    BadState {
        /// Description of the misuse.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The peer sent something the protocol backend cannot decode.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Internal Errors
    // ========================================================================
    /// Unexpected fault inside the crate.
    #[error("Internal error: {message}")]
    Internal {
        /// Diagnostic context.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket framing error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid option error.
    #[inline]
    pub fn invalid_option(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a retries exhausted error.
    #[inline]
    pub fn retries_exhausted(host: impl Into<String>, port: u16, attempts: u32) -> Self {
        Self::RetriesExhausted {
            host: host.into(),
            port,
            attempts,
        }
    }

    /// Creates a bad state error.
    #[inline]
    pub fn bad_state(message: impl Into<String>) -> Self {
        Self::BadState {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Tls { .. }
                | Self::ConnectionClosed
                | Self::RetriesExhausted { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if the error is a misuse the caller should hear about
    /// while the connection keeps running.
    #[inline]
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::BadState { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors are handled by reconnecting.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Tls { .. }
                | Self::ConnectionClosed
                | Self::Protocol { .. }
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
