//! Connection handle and actor.
//!
//! [`Connection`] is the public face of one connection actor. Every call is
//! a message posted to the actor's mailbox; none of them waits for the
//! network. Results arrive on the owner's [`Events`] channel.
//!
//! # State machine
//!
//! ```text
//!              connect ok                 ws_upgrade
//! Connecting ─────────────────► Active ─────────────────► WsActive
//!   │    ▲                        │                          │
//!   │    │ retry timer            │ socket lost              │ socket lost
//!   ▼    │                        ▼                          ▼
//! RetryWait               Connecting (full budget)   Connecting (full budget)
//! ```
//!
//! Connecting with no retries left terminates the actor.

// ============================================================================
// Submodules
// ============================================================================

pub(crate) mod actor;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Event, Headers, Notifier, WsFrame};
use crate::identifiers::{CallerId, ConnectionId, StreamRef};
use crate::protocol::{Protocol, Request};
use crate::supervisor::{ExitStatus, Supervisor};

// ============================================================================
// Types
// ============================================================================

/// Receiving end of a connection's notifications.
pub type Events = mpsc::UnboundedReceiver<Event>;

/// Instruction for the actor, sent by a handle.
#[derive(Debug)]
pub(crate) enum Message {
    Request(Request),
    Data {
        stream: StreamRef,
        is_fin: bool,
        data: Bytes,
    },
    Cancel(StreamRef),
    WsUpgrade {
        path: String,
        headers: Headers,
    },
    WsSend(Vec<WsFrame>),
    Shutdown,
}

impl Message {
    /// Returns the stream the message concerns, if any.
    pub(crate) fn stream(&self) -> Option<StreamRef> {
        match self {
            Self::Request(request) => Some(request.stream),
            Self::Data { stream, .. } | Self::Cancel(stream) => Some(*stream),
            Self::WsUpgrade { .. } | Self::WsSend(_) | Self::Shutdown => None,
        }
    }
}

/// A message plus the identity of whoever sent it.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub from: CallerId,
    /// Where to report a rejected message. `None` for the owner, whose
    /// notifications always go to the owner channel.
    pub reply_to: Option<Notifier>,
    pub message: Message,
}

/// Supervision request, serviced in every state.
#[derive(Debug)]
pub(crate) enum Control {
    Suspend,
    Resume,
    Describe(oneshot::Sender<ConnectionInfo>),
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Where the actor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening a socket.
    Connecting,
    /// Waiting before the next connect attempt.
    RetryWait,
    /// Serving requests over HTTP/1.1 or SPDY.
    Active,
    /// Upgraded to WebSocket.
    WsActive,
}

impl ConnectionState {
    /// Returns the state as a static string.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::RetryWait => "retry_wait",
            Self::Active => "active",
            Self::WsActive => "ws_active",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`Connection::describe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Current state.
    pub state: ConnectionState,
    /// Connect attempts left before giving up.
    pub retries_left: u32,
    /// Protocol of the current socket, if connected.
    pub protocol: Option<Protocol>,
    /// `true` while suspended.
    pub suspended: bool,
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to a connection actor.
///
/// Cloning a handle keeps the owner's identity. Use [`detached`] to obtain a
/// handle that acts as a different caller.
///
/// [`detached`]: Connection::detached
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    authority: String,
    caller: CallerId,
    reply_to: Option<Notifier>,
    mailbox: mpsc::UnboundedSender<Envelope>,
    control: mpsc::UnboundedSender<Control>,
    exit: watch::Receiver<Option<ExitStatus>>,
    supervisor: Supervisor,
}

/// Channels tying a handle to its actor.
#[derive(Debug)]
pub(crate) struct Wiring {
    pub id: ConnectionId,
    pub authority: String,
    pub owner: CallerId,
    pub mailbox: mpsc::UnboundedSender<Envelope>,
    pub control: mpsc::UnboundedSender<Control>,
    pub exit: watch::Receiver<Option<ExitStatus>>,
    pub supervisor: Supervisor,
}

impl Connection {
    /// Creates the owner's handle.
    pub(crate) fn new(wiring: Wiring) -> Self {
        Self {
            id: wiring.id,
            authority: wiring.authority,
            caller: wiring.owner,
            reply_to: None,
            mailbox: wiring.mailbox,
            control: wiring.control,
            exit: wiring.exit,
            supervisor: wiring.supervisor,
        }
    }

    /// Returns the connection identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the identity this handle sends as.
    #[inline]
    #[must_use]
    pub fn caller(&self) -> CallerId {
        self.caller
    }

    /// Returns a handle with its own identity and notification channel.
    ///
    /// The actor rejects everything a detached handle sends with a
    /// [`NotOwner`](crate::ErrorReason::NotOwner) error on that channel.
    #[must_use]
    pub fn detached(&self) -> (Self, Events) {
        let (notifier, events) = Notifier::channel();
        let handle = Self {
            caller: CallerId::generate(),
            reply_to: Some(notifier),
            ..self.clone()
        };
        (handle, events)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Sends a request and returns the token its events will carry.
    ///
    /// Without `body`, a `content-length` or `transfer-encoding` header
    /// announces a body streamed later with [`data`](Self::data).
    pub fn request(
        &self,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Headers,
        body: Option<Bytes>,
    ) -> StreamRef {
        let stream = StreamRef::generate();
        self.enqueue(Message::Request(Request {
            stream,
            method: method.into(),
            authority: self.authority.clone(),
            path: path.into(),
            headers,
            body,
        }));
        stream
    }

    /// Sends a `GET` request.
    pub fn get(&self, path: impl Into<String>, headers: Headers) -> StreamRef {
        self.request("GET", path, headers, None)
    }

    /// Sends a `HEAD` request.
    pub fn head(&self, path: impl Into<String>, headers: Headers) -> StreamRef {
        self.request("HEAD", path, headers, None)
    }

    /// Sends an `OPTIONS` request.
    pub fn options(&self, path: impl Into<String>, headers: Headers) -> StreamRef {
        self.request("OPTIONS", path, headers, None)
    }

    /// Sends a `DELETE` request.
    pub fn delete(&self, path: impl Into<String>, headers: Headers) -> StreamRef {
        self.request("DELETE", path, headers, None)
    }

    /// Sends a `POST` request with a complete body.
    pub fn post(&self, path: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> StreamRef {
        self.request("POST", path, headers, Some(body.into()))
    }

    /// Sends a `PUT` request with a complete body.
    pub fn put(&self, path: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> StreamRef {
        self.request("PUT", path, headers, Some(body.into()))
    }

    /// Sends a `PATCH` request with a complete body.
    pub fn patch(&self, path: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> StreamRef {
        self.request("PATCH", path, headers, Some(body.into()))
    }

    /// Sends a chunk of a streamed request body.
    pub fn data(&self, stream: StreamRef, is_fin: bool, data: impl Into<Bytes>) {
        self.enqueue(Message::Data {
            stream,
            is_fin,
            data: data.into(),
        });
    }

    /// Stops delivery of a stream's events.
    pub fn cancel(&self, stream: StreamRef) {
        self.enqueue(Message::Cancel(stream));
    }

    // ========================================================================
    // WebSocket
    // ========================================================================

    /// Upgrades the connection to WebSocket.
    ///
    /// [`Event::WsUpgraded`] follows once the server accepts.
    pub fn ws_upgrade(&self, path: impl Into<String>, headers: Headers) {
        self.enqueue(Message::WsUpgrade {
            path: path.into(),
            headers,
        });
    }

    /// Sends one WebSocket frame.
    pub fn ws_send(&self, frame: WsFrame) {
        self.ws_send_all(vec![frame]);
    }

    /// Sends several WebSocket frames in order.
    pub fn ws_send_all(&self, frames: Vec<WsFrame>) {
        self.enqueue(Message::WsSend(frames));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Says goodbye to the peer, flushes pending writes and stops the actor.
    pub fn shutdown(&self) {
        self.enqueue(Message::Shutdown);
    }

    /// Stops the actor immediately.
    pub fn close(&self) {
        self.supervisor.terminate(self.id);
    }

    /// Pauses the actor. Only supervision requests are serviced until
    /// [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.send_control(Control::Suspend);
    }

    /// Resumes a suspended actor.
    pub fn resume(&self) {
        self.send_control(Control::Resume);
    }

    /// Returns a snapshot of the actor's state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the actor has stopped.
    pub async fn describe(&self) -> Result<ConnectionInfo> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Describe(tx))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Waits for the actor to stop and returns how it ended.
    pub async fn closed(&self) -> ExitStatus {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(Option::is_some).await {
            Ok(status) => (*status).clone(),
            Err(_) => None,
        };
        status.unwrap_or(ExitStatus::Killed)
    }

    /// Returns `true` once the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn enqueue(&self, message: Message) {
        let envelope = Envelope {
            from: self.caller,
            reply_to: self.reply_to.clone(),
            message,
        };
        if self.mailbox.send(envelope).is_err() {
            debug!(id = %self.id, "Connection stopped, message dropped");
        }
    }

    fn send_control(&self, control: Control) {
        if self.control.send(control).is_err() {
            debug!(id = %self.id, "Connection stopped, control dropped");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
