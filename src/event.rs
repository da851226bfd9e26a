//! Notifications delivered to the owner of a connection.
//!
//! Every response, body chunk, WebSocket frame and error reaches the owner as
//! an [`Event`] on the channel returned by [`open`](crate::open). Events that
//! belong to a request carry its [`StreamRef`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::StreamRef;

// ============================================================================
// Types
// ============================================================================

/// Header list. Names from the peer are lowercased.
pub type Headers = Vec<(String, String)>;

// ============================================================================
// Event
// ============================================================================

/// Asynchronous notification sent to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Response head for a stream.
    Response {
        /// Stream the response belongs to.
        stream: StreamRef,
        /// `true` if no body follows.
        is_fin: bool,
        /// Status code.
        status: u16,
        /// Response headers.
        headers: Headers,
    },

    /// A chunk of response body.
    Data {
        /// Stream the body belongs to.
        stream: StreamRef,
        /// `true` on the last chunk.
        is_fin: bool,
        /// Body bytes, possibly empty on the final chunk.
        data: Bytes,
    },

    /// The WebSocket handshake completed.
    WsUpgraded {
        /// Headers of the `101 Switching Protocols` response.
        headers: Headers,
    },

    /// A WebSocket frame from the peer.
    WsFrame(WsFrame),

    /// Something went wrong.
    Error {
        /// Stream the error concerns, if any.
        stream: Option<StreamRef>,
        /// Error category.
        reason: ErrorReason,
        /// Human-readable description.
        message: String,
    },
}

impl Event {
    /// Returns the stream this event belongs to, if any.
    #[must_use]
    pub fn stream(&self) -> Option<StreamRef> {
        match self {
            Self::Response { stream, .. } | Self::Data { stream, .. } => Some(*stream),
            Self::Error { stream, .. } => *stream,
            Self::WsUpgraded { .. } | Self::WsFrame(_) => None,
        }
    }

    /// Returns the error reason if this is an error event.
    #[must_use]
    pub fn error_reason(&self) -> Option<ErrorReason> {
        match self {
            Self::Error { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

// ============================================================================
// ErrorReason
// ============================================================================

/// Category of an [`Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// Unexpected fault inside the connection.
    Internal,
    /// The sender does not own the connection.
    NotOwner,
    /// Operation not valid in the current mode.
    BadState,
    /// The peer violated the protocol for this stream.
    Protocol,
    /// The peer reset the stream, or the connection mode changed under it.
    StreamReset,
    /// The socket carrying the stream was lost.
    ConnectionLost,
    /// The connection gave up reconnecting and terminated.
    RetriesExhausted,
}

impl ErrorReason {
    /// Returns the reason as a static string.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::NotOwner => "not_owner",
            Self::BadState => "bad_state",
            Self::Protocol => "protocol",
            Self::StreamReset => "stream_reset",
            Self::ConnectionLost => "connection_lost",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// WsFrame
// ============================================================================

/// A WebSocket frame, sent with [`ws_send`](crate::Connection::ws_send) or
/// received as [`Event::WsFrame`].
///
/// Fragmented messages are reassembled before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Ping. Incoming pings are answered automatically.
    Ping(Bytes),
    /// Pong.
    Pong(Bytes),
    /// Close, with optional status code and reason.
    Close(Option<(u16, String)>),
}

impl WsFrame {
    /// Creates a text frame.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Creates a binary frame.
    #[inline]
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Sending side of an owner's event channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Event>,
}

impl Notifier {
    /// Creates a notifier and the receiving end handed to the owner.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Delivers an event. A vanished owner is not an error.
    pub(crate) fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("Owner inbox closed, dropping event");
        }
    }

    pub(crate) fn response(&self, stream: StreamRef, is_fin: bool, status: u16, headers: Headers) {
        self.send(Event::Response {
            stream,
            is_fin,
            status,
            headers,
        });
    }

    pub(crate) fn data(&self, stream: StreamRef, is_fin: bool, data: Bytes) {
        self.send(Event::Data {
            stream,
            is_fin,
            data,
        });
    }

    pub(crate) fn error(
        &self,
        stream: Option<StreamRef>,
        reason: ErrorReason,
        message: impl Into<String>,
    ) {
        self.send(Event::Error {
            stream,
            reason,
            message: message.into(),
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
