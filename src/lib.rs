//! Tether - self-healing client connections.
//!
//! Each connection is a long-lived actor that owns one socket to a remote
//! host and speaks HTTP/1.1, SPDY/3.1 or WebSocket over it. Lost sockets
//! are reopened transparently within a retry budget; callers talk to the
//! actor through a cloneable [`Connection`] handle and receive results as
//! [`Event`]s.
//!
//! # Architecture
//!
//! ```text
//! Connection ──mailbox──► Actor ──► Backend (HTTP/1.1 | SPDY | WebSocket)
//!     ▲                     │                 │
//!     └──── Events ◄────────┘                 ▼
//!                                  Socket (TCP | TLS + ALPN)
//! ```
//!
//! - Every call on a [`Connection`] is fire-and-forget; nothing blocks on I/O
//! - The [`Supervisor`] starts actors and records how they exit
//! - Only the owner (the handle returned by [`open`]) may issue requests;
//!   [`Connection::detached`] handles get a `not_owner` error instead
//!
//! # Quick Start
//!
//! ```no_run
//! use tether::{Event, Options, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (conn, mut events) = tether::open("example.com", 443, Options::new())?;
//!
//!     let stream = conn.get("/", Vec::new());
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::Response { status, .. } => println!("status {status}"),
//!             Event::Data { is_fin: true, .. } => break,
//!             Event::Error { message, .. } => eprintln!("{message}"),
//!             _ => {}
//!         }
//!     }
//!
//!     conn.cancel(stream);
//!     conn.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`Connection`] handle and the actor behind it |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`event`] | Notifications delivered to the owner |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`options`] | Connection options and validation |
//! | [`protocol`] | HTTP/1.1, SPDY and WebSocket backends |
//! | [`supervisor`] | Actor lifecycle and exit reporting |
//! | [`transport`] | TCP and TLS sockets |

// ============================================================================
// Modules
// ============================================================================

/// Connection handle and actor state machine.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Notifications delivered to a connection's owner.
pub mod event;

/// Type-safe identifiers for connections, callers and streams.
pub mod identifiers;

/// Connection options.
pub mod options;

/// Protocol backends.
///
/// Encode requests and decode responses for one socket at a time.
pub mod protocol;

/// Connection supervision.
pub mod supervisor;

/// Socket layer.
///
/// Establishes TCP and TLS streams and pumps bytes between them and the actor.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{Connection, ConnectionInfo, ConnectionState, Events};

// Error types
pub use error::{Error, Result};

// Event types
pub use event::{ErrorReason, Event, Headers, WsFrame};

// Identifier types
pub use identifiers::{CallerId, ConnectionId, StreamRef};

// Option types
pub use options::{ConnectionType, Options};

// Protocol types
pub use protocol::Protocol;

// Supervision
pub use supervisor::{ExitStatus, Supervisor};

// Transport types
pub use transport::{Connector, Socket, TcpConnector, TlsConnector};

// ============================================================================
// Entry Point
// ============================================================================

/// Starts a connection to `host:port` under the global [`Supervisor`].
///
/// The returned [`Connection`] is the owner handle; `Events` receives every
/// notification for it. Connecting happens in the background, so requests
/// may be issued right away.
///
/// # Errors
///
/// - [`Error::InvalidOption`] if `options` or `host` is invalid
/// - [`Error::Internal`] if called outside a tokio runtime
pub fn open(host: impl Into<String>, port: u16, options: Options) -> Result<(Connection, Events)> {
    Supervisor::global().open(host, port, options)
}
