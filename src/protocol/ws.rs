//! WebSocket backend.
//!
//! Takes over an HTTP/1.1 connection for an upgrade. tungstenite drives both
//! the client handshake and the framing over an in-memory [`Pipe`]: bytes
//! read from the socket are fed in, and whatever tungstenite writes is
//! drained to the socket. Frames the owner sends before the handshake
//! completes are queued.
//!
//! Pings are answered with pongs and a close from the server is echoed.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{ClientHandshake, Request, Response};
use tokio_tungstenite::tungstenite::handshake::{HandshakeError, MidHandshake, derive_accept_key};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{WebSocket, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::event::{ErrorReason, Event, Headers, WsFrame};
use crate::identifiers::StreamRef;
use crate::transport::SocketWriter;

use super::{Backend, BackendContext, Protocol};

// ============================================================================
// Constants
// ============================================================================

/// Largest message accepted from the server.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest control frame payload allowed by RFC 6455.
const MAX_CONTROL_PAYLOAD: usize = 125;

// ============================================================================
// Handshake
// ============================================================================

/// Upgrade request prepared for a connection.
#[derive(Debug)]
pub struct Handshake {
    request: Request,
}

impl Handshake {
    /// Builds the upgrade request for `path` on the connection described by
    /// `context`. Caller headers replace generated ones of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadState`] if the path or a header cannot be sent.
    pub fn new(context: &BackendContext, path: &str, headers: Headers) -> Result<Self> {
        let scheme = if context.secure { "wss" } else { "ws" };
        let mut request = format!("{scheme}://{}{path}", context.authority)
            .into_client_request()
            .map_err(|e| Error::bad_state(format!("invalid upgrade target `{path}`: {e}")))?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::bad_state(format!("invalid header name `{key}`: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::bad_state(format!("invalid value for `{key}`: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        Ok(Self { request })
    }

    /// Returns the `sec-websocket-key` that will be sent.
    #[must_use]
    pub fn key(&self) -> &str {
        self.request
            .headers()
            .get("sec-websocket-key")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    /// Returns the `sec-websocket-accept` value the server must answer with.
    #[must_use]
    pub fn expected_accept(&self) -> String {
        derive_accept_key(self.key().as_bytes())
    }
}

// ============================================================================
// Pipe
// ============================================================================

/// In-memory stream between tungstenite and the socket.
///
/// Reads report `WouldBlock` once the input is used up, which is how
/// tungstenite learns it has to wait for more bytes.
#[derive(Debug, Default)]
struct Pipe {
    input: BytesMut,
    output: BytesMut,
}

impl Pipe {
    /// Sends everything tungstenite wrote so far.
    fn drain_to(&mut self, socket: &SocketWriter) -> Result<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        socket.send(self.output.split().freeze())
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input.advance(n);
        Ok(n)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// WsBackend
// ============================================================================

enum State {
    Handshaking {
        handshake: MidHandshake<ClientHandshake<Pipe>>,
        queued: Vec<WsFrame>,
    },
    Open(WebSocket<Pipe>),
    Closed,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshaking { queued, .. } => f
                .debug_struct("Handshaking")
                .field("queued", &queued.len())
                .finish_non_exhaustive(),
            Self::Open(_) => f.write_str("Open"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// WebSocket protocol backend.
#[derive(Debug)]
pub struct WsBackend {
    context: BackendContext,
    state: State,
}

impl WsBackend {
    /// Starts the handshake. The upgrade request is written to the socket
    /// right away.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if tungstenite refuses the request
    /// - [`Error::ConnectionClosed`] if the socket is gone
    pub fn new(context: BackendContext, handshake: Handshake) -> Result<Self> {
        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_MESSAGE_SIZE))
            .max_frame_size(Some(MAX_MESSAGE_SIZE));
        let started = ClientHandshake::start(Pipe::default(), handshake.request, Some(config))
            .map_err(|e| Error::bad_state(format!("invalid upgrade request: {e}")))?;

        match started.handshake() {
            Err(HandshakeError::Interrupted(mut handshake)) => {
                handshake.get_mut().get_mut().drain_to(&context.socket)?;
                Ok(Self {
                    context,
                    state: State::Handshaking {
                        handshake,
                        queued: Vec::new(),
                    },
                })
            }
            Err(HandshakeError::Failure(e)) => Err(Error::bad_state(format!(
                "invalid upgrade request: {e}"
            ))),
            Ok(_) => Err(Error::internal("handshake finished without a response")),
        }
    }

    /// Returns `true` once the handshake has completed.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    fn advance_handshake(&mut self) -> Result<()> {
        let State::Handshaking { handshake, queued } =
            std::mem::replace(&mut self.state, State::Closed)
        else {
            return Ok(());
        };

        match handshake.handshake() {
            Err(HandshakeError::Interrupted(handshake)) => {
                self.state = State::Handshaking { handshake, queued };
                Ok(())
            }
            Err(HandshakeError::Failure(e)) => {
                let message = format!("WebSocket upgrade failed: {e}");
                self.context
                    .owner
                    .error(None, ErrorReason::Protocol, message.clone());
                Err(Error::protocol(message))
            }
            Ok((ws, response)) => {
                debug!("WebSocket handshake complete");
                self.context.owner.send(Event::WsUpgraded {
                    headers: response_headers(&response),
                });
                self.state = State::Open(ws);

                match self.send_frames(queued) {
                    Err(e) if e.is_usage_error() => {
                        self.context
                            .owner
                            .error(None, ErrorReason::BadState, e.to_string());
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    fn read_messages(&mut self) -> Result<()> {
        loop {
            let State::Open(ws) = &mut self.state else {
                return Ok(());
            };

            let result = ws.read();
            if matches!(result, Ok(Message::Close(_))) {
                // Queues the reply to a close from the server.
                ws.flush()?;
            }
            ws.get_mut().drain_to(&self.context.socket)?;

            match result {
                Ok(message) => self.on_message(message),
                Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        let frame = match message {
            Message::Text(text) => WsFrame::Text(text.as_str().to_owned()),
            Message::Binary(data) => WsFrame::Binary(data),
            Message::Ping(data) => WsFrame::Ping(data),
            Message::Pong(data) => WsFrame::Pong(data),
            Message::Close(frame) => {
                let close =
                    frame.map(|frame| (u16::from(frame.code), frame.reason.as_str().to_owned()));
                debug!(?close, "WebSocket closed by server");
                self.state = State::Closed;
                WsFrame::Close(close)
            }
            Message::Frame(_) => return,
        };
        self.context.owner.send(Event::WsFrame(frame));
    }

    fn send_frames(&mut self, frames: Vec<WsFrame>) -> Result<()> {
        let State::Open(ws) = &mut self.state else {
            return Err(Error::bad_state("WebSocket is closed"));
        };

        let written = frames
            .into_iter()
            .try_for_each(|frame| write_frame(ws, frame));
        let flushed = ws.flush();
        ws.get_mut().drain_to(&self.context.socket)?;

        written?;
        flushed?;
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

impl Backend for WsBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    fn handle(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.state {
            State::Handshaking { handshake, .. } => {
                handshake.get_mut().get_mut().input.extend_from_slice(data);
            }
            State::Open(ws) => ws.get_mut().input.extend_from_slice(data),
            State::Closed => {
                trace!(bytes = data.len(), "Discarding bytes after close");
                return Ok(());
            }
        }

        self.advance_handshake()?;
        self.read_messages()
    }

    fn keepalive(&mut self) -> Result<()> {
        if let State::Open(ws) = &mut self.state
            && ws.can_write()
        {
            ws.send(Message::Ping(Default::default()))?;
            ws.get_mut().drain_to(&self.context.socket)?;
        }
        Ok(())
    }

    fn ws_send(&mut self, frames: Vec<WsFrame>) -> Result<()> {
        match &mut self.state {
            State::Handshaking { queued, .. } => {
                queued.extend(frames);
                Ok(())
            }
            State::Open(_) => self.send_frames(frames),
            State::Closed => Err(Error::bad_state("WebSocket is closed")),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if let State::Open(ws) = &mut self.state
            && ws.can_write()
        {
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static(""),
            }))?;
            ws.get_mut().drain_to(&self.context.socket)?;
        }
        Ok(())
    }

    fn down(&mut self) -> Vec<StreamRef> {
        if !matches!(self.state, State::Closed) {
            self.context.owner.error(
                None,
                ErrorReason::ConnectionLost,
                "WebSocket connection lost",
            );
        }
        self.state = State::Closed;
        Vec::new()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Validates one owner frame and hands it to tungstenite.
fn write_frame(ws: &mut WebSocket<Pipe>, frame: WsFrame) -> Result<()> {
    if !ws.can_write() {
        return Err(Error::bad_state("WebSocket close already sent"));
    }

    let control_len = match &frame {
        WsFrame::Ping(data) | WsFrame::Pong(data) => data.len(),
        WsFrame::Close(Some((_, reason))) => 2 + reason.len(),
        WsFrame::Close(None) | WsFrame::Text(_) | WsFrame::Binary(_) => 0,
    };
    if control_len > MAX_CONTROL_PAYLOAD {
        return Err(Error::bad_state(format!(
            "control frame payload of {control_len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
        )));
    }

    let message = match frame {
        WsFrame::Text(text) => Message::text(text),
        WsFrame::Binary(data) => Message::Binary(data),
        WsFrame::Ping(data) => Message::Ping(data),
        WsFrame::Pong(data) => Message::Pong(data),
        WsFrame::Close(close) => Message::Close(close.map(|(code, reason)| CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from(reason),
        })),
    };
    ws.write(message)?;
    Ok(())
}

/// Response headers as `(name, value)` pairs with lowercase names.
fn response_headers(response: &Response) -> Headers {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
