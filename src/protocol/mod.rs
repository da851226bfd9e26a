//! Protocol backends.
//!
//! A backend encodes owner calls onto the socket and decodes inbound bytes
//! into owner [`Event`](crate::Event)s. The connection actor only ever sees
//! the [`Backend`] trait, so HTTP/1.1, SPDY and WebSocket share its retry,
//! keepalive and ownership logic.
//!
//! | Protocol | Backend | Keepalive | Upgrade |
//! |----------|---------|-----------|---------|
//! | HTTP/1.1 | [`HttpBackend`] | none | to WebSocket |
//! | SPDY/3.1 | [`SpdyBackend`] | `PING` | rejected |
//! | WebSocket | [`WsBackend`] | ping frame | n/a |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `http` | HTTP/1.1 with pipelining |
//! | `spdy` | SPDY/3.1 framing and streams |
//! | `ws` | WebSocket handshake and frames |

// ============================================================================
// Submodules
// ============================================================================

/// HTTP/1.1 backend.
pub mod http;

/// SPDY backend.
pub mod spdy;

/// WebSocket backend.
pub mod ws;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::event::{Headers, Notifier, WsFrame};
use crate::identifiers::StreamRef;
use crate::transport::SocketWriter;

pub use http::HttpBackend;
pub use spdy::SpdyBackend;
pub use ws::{Handshake, WsBackend};

// ============================================================================
// Protocol
// ============================================================================

/// Application protocol spoken on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1.
    Http,
    /// SPDY/3.1.
    Spdy,
    /// WebSocket, reached only by upgrading an HTTP connection.
    Ws,
}

impl Protocol {
    /// Protocols advertised over ALPN, most preferred first.
    pub const ALPN_PREFERENCE: [Protocol; 2] = [Protocol::Spdy, Protocol::Http];

    /// Returns the ALPN identifier.
    #[inline]
    #[must_use]
    pub const fn alpn_id(&self) -> &'static [u8] {
        match self {
            Self::Http => b"http/1.1",
            Self::Spdy => b"spdy/3.1",
            Self::Ws => b"websocket",
        }
    }

    /// Maps a negotiated ALPN identifier back to a protocol.
    #[must_use]
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        Self::ALPN_PREFERENCE
            .into_iter()
            .find(|protocol| protocol.alpn_id() == id)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Spdy => "spdy",
            Self::Ws => "ws",
        })
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request handed to a backend.
#[derive(Debug, Clone)]
pub struct Request {
    /// Correlation token.
    pub stream: StreamRef,
    /// Method, e.g. `GET`.
    pub method: String,
    /// `host[:port]` sent as the host header.
    pub authority: String,
    /// Request target.
    pub path: String,
    /// Caller-supplied headers.
    pub headers: Headers,
    /// Complete body. `None` means no body, or one streamed later with
    /// `data` when the headers declare it.
    pub body: Option<Bytes>,
}

impl Request {
    /// Returns `true` if the headers announce a body sent through `data`.
    #[must_use]
    pub fn declares_body(&self) -> bool {
        self.headers.iter().any(|(name, _)| {
            name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
        })
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Everything a backend needs from the connection that created it.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Owner's event channel.
    pub owner: Notifier,
    /// Write handle of the current socket.
    pub socket: SocketWriter,
    /// `host[:port]` of the remote end.
    pub authority: String,
    /// `true` over TLS.
    pub secure: bool,
}

/// Capability interface shared by every wire protocol.
///
/// Errors returned from a backend fall in two groups: usage errors
/// ([`Error::BadState`]) are reported to the owner and the connection keeps
/// going; anything else means the socket can no longer be trusted and the
/// connection reconnects.
pub trait Backend: Send + fmt::Debug {
    /// Protocol implemented by this backend.
    fn protocol(&self) -> Protocol;

    /// Consumes bytes read from the socket.
    fn handle(&mut self, data: &[u8]) -> Result<()>;

    /// Sends a protocol-level liveness signal, if the protocol has one.
    fn keepalive(&mut self) -> Result<()>;

    /// Starts a new stream.
    fn request(&mut self, request: Request) -> Result<()> {
        let _ = request;
        Err(Error::bad_state(format!(
            "{} connections do not accept requests",
            self.protocol()
        )))
    }

    /// Sends a chunk of request body.
    fn data(&mut self, stream: StreamRef, is_fin: bool, data: Bytes) -> Result<()> {
        let _ = (stream, is_fin, data);
        Err(Error::bad_state(format!(
            "{} connections do not stream request bodies",
            self.protocol()
        )))
    }

    /// Stops tracking a stream. Unknown streams are ignored.
    fn cancel(&mut self, stream: StreamRef) -> Result<()> {
        let _ = stream;
        Err(Error::bad_state(format!(
            "{} connections have no streams to cancel",
            self.protocol()
        )))
    }

    /// Sends a WebSocket upgrade request.
    fn ws_upgrade(&mut self, path: &str, headers: Headers) -> Result<Handshake> {
        let _ = (path, headers);
        Err(Error::bad_state(format!(
            "WebSocket is not supported over {}",
            self.protocol()
        )))
    }

    /// Sends WebSocket frames.
    fn ws_send(&mut self, frames: Vec<WsFrame>) -> Result<()> {
        let _ = frames;
        Err(Error::bad_state(
            "connection must be upgraded to WebSocket before sending frames",
        ))
    }

    /// Says goodbye to the peer before a graceful close.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the socket is gone. Finishes anything delimited by the
    /// close and returns the streams that were still in flight.
    fn down(&mut self) -> Vec<StreamRef>;
}

/// Creates the backend for a freshly negotiated protocol.
///
/// # Errors
///
/// Returns [`Error::Internal`] for [`Protocol::Ws`], which is only reachable
/// through an upgrade handshake.
pub fn init(protocol: Protocol, context: BackendContext) -> Result<Box<dyn Backend>> {
    match protocol {
        Protocol::Http => Ok(Box::new(HttpBackend::new(context))),
        Protocol::Spdy => Ok(Box::new(SpdyBackend::new(context))),
        Protocol::Ws => Err(Error::internal(
            "a WebSocket backend can only be created by an upgrade",
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
