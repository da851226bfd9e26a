//! SPDY/3.1 backend.
//!
//! Every request is its own stream on a shared session. Client streams use
//! odd ids, keepalive pings use odd ids, and server pushes are refused.
//! Received data is credited back with `WINDOW_UPDATE` as it is delivered.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame codec and header blocks |

/// Frame codec.
pub mod frame;

// ============================================================================
// Imports
// ============================================================================

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{ErrorReason, Headers};
use crate::identifiers::StreamRef;

use super::{Backend, BackendContext, Protocol, Request};

pub use frame::{Frame, RstStatus};

// ============================================================================
// Constants
// ============================================================================

/// Largest stream id before the session must be replaced.
const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Largest DATA payload sent in one frame.
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Headers that are connection-specific and invalid on a SPDY stream.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
];

// ============================================================================
// Types
// ============================================================================

#[derive(Debug)]
struct SpdyStream {
    stream: StreamRef,
    replied: bool,
    local_fin: bool,
}

// ============================================================================
// SpdyBackend
// ============================================================================

/// SPDY/3.1 protocol backend.
#[derive(Debug)]
pub struct SpdyBackend {
    context: BackendContext,
    buffer: BytesMut,
    streams: FxHashMap<u32, SpdyStream>,
    ids: FxHashMap<StreamRef, u32>,
    next_stream_id: u32,
    next_ping_id: u32,
    going_away: bool,
}

impl SpdyBackend {
    /// Creates a backend for a fresh session.
    #[must_use]
    pub fn new(context: BackendContext) -> Self {
        Self {
            context,
            buffer: BytesMut::new(),
            streams: FxHashMap::default(),
            ids: FxHashMap::default(),
            next_stream_id: 1,
            next_ping_id: 1,
            going_away: false,
        }
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        trace!(?frame, "SPDY frame sent");
        self.context.socket.send(frame.to_bytes()?)
    }

    /// Sends a body as DATA frames of at most [`MAX_DATA_CHUNK`] bytes. Only
    /// the last one carries `fin`.
    fn send_body(&self, stream_id: u32, fin: bool, mut data: Bytes) -> Result<()> {
        loop {
            let chunk = data.split_to(data.len().min(MAX_DATA_CHUNK));
            let last = data.is_empty();
            self.send(&Frame::Data {
                stream_id,
                fin: fin && last,
                data: chunk,
            })?;
            if last {
                return Ok(());
            }
        }
    }

    fn remove(&mut self, stream_id: u32) -> Option<StreamRef> {
        let removed = self.streams.remove(&stream_id)?;
        self.ids.remove(&removed.stream);
        Some(removed.stream)
    }

    /// Resets a stream we can no longer make sense of.
    fn stream_error(&mut self, stream_id: u32, message: String) -> Result<()> {
        if let Some(stream) = self.remove(stream_id) {
            self.context
                .owner
                .error(Some(stream), ErrorReason::Protocol, message);
        }
        self.send(&Frame::RstStream {
            stream_id,
            status: RstStatus::PROTOCOL_ERROR,
        })
    }

    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        trace!(?frame, "SPDY frame received");

        match frame {
            Frame::SynReply {
                stream_id,
                fin,
                headers,
            } => self.on_reply(stream_id, fin, headers),
            Frame::Data {
                stream_id,
                fin,
                data,
            } => self.on_data(stream_id, fin, data),
            Frame::Headers {
                stream_id,
                fin,
                headers: _,
            } => {
                if fin && let Some(stream) = self.remove(stream_id) {
                    self.context.owner.data(stream, true, Bytes::new());
                }
                Ok(())
            }
            Frame::RstStream { stream_id, status } => {
                if let Some(stream) = self.remove(stream_id) {
                    debug!(%stream, status = status.name(), "SPDY stream reset by peer");
                    self.context.owner.error(
                        Some(stream),
                        ErrorReason::StreamReset,
                        format!("stream reset by peer: {}", status.name()),
                    );
                }
                Ok(())
            }
            Frame::SynStream { stream_id, .. } => {
                debug!(stream_id, "Refusing server push");
                self.send(&Frame::RstStream {
                    stream_id,
                    status: RstStatus::REFUSED_STREAM,
                })
            }
            Frame::Ping { id } if id % 2 == 0 => self.send(&Frame::Ping { id }),
            Frame::Ping { id } => {
                trace!(id, "SPDY ping answered");
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                status,
            } => {
                debug!(last_stream_id, status, "SPDY session going away");
                self.going_away = true;

                let unprocessed: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id)
                    .collect();
                for stream_id in unprocessed {
                    if let Some(stream) = self.remove(stream_id) {
                        self.context.owner.error(
                            Some(stream),
                            ErrorReason::StreamReset,
                            "stream refused by GOAWAY",
                        );
                    }
                }
                Ok(())
            }
            Frame::Settings { entries } => {
                trace!(count = entries.len(), "SPDY settings received");
                Ok(())
            }
            Frame::WindowUpdate { .. } | Frame::Unknown { .. } => Ok(()),
        }
    }

    fn on_reply(&mut self, stream_id: u32, fin: bool, headers: Headers) -> Result<()> {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            trace!(stream_id, "SYN_REPLY for unknown stream");
            return Ok(());
        };
        if entry.replied {
            return self.stream_error(stream_id, "duplicate SYN_REPLY".into());
        }

        let status = headers
            .iter()
            .find(|(name, _)| name == ":status")
            .and_then(|(_, value)| value.split(' ').next())
            .and_then(|code| code.parse::<u16>().ok());
        let Some(status) = status else {
            return self.stream_error(stream_id, "SYN_REPLY without a valid :status".into());
        };

        entry.replied = true;
        let stream = entry.stream;
        let headers = headers
            .into_iter()
            .filter(|(name, _)| !name.starts_with(':'))
            .collect();
        self.context.owner.response(stream, fin, status, headers);

        if fin {
            self.remove(stream_id);
        }
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, fin: bool, data: Bytes) -> Result<()> {
        let len = data.len() as u32;
        if len > 0 {
            self.send(&Frame::WindowUpdate {
                stream_id: 0,
                delta: len,
            })?;
        }

        let Some(entry) = self.streams.get(&stream_id) else {
            trace!(stream_id, "DATA for unknown stream");
            return Ok(());
        };
        if !entry.replied {
            return self.stream_error(stream_id, "DATA before SYN_REPLY".into());
        }

        let stream = entry.stream;
        self.context.owner.data(stream, fin, data);

        if fin {
            self.remove(stream_id);
        } else if len > 0 {
            self.send(&Frame::WindowUpdate {
                stream_id,
                delta: len,
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

impl Backend for SpdyBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Spdy
    }

    fn handle(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);

        while let Some((frame, used)) = Frame::decode(&self.buffer)? {
            let _ = self.buffer.split_to(used);
            self.on_frame(frame)?;
        }

        if self.going_away && self.streams.is_empty() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn keepalive(&mut self) -> Result<()> {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(2);
        self.send(&Frame::Ping { id })
    }

    fn request(&mut self, request: Request) -> Result<()> {
        if self.going_away {
            self.context.owner.error(
                Some(request.stream),
                ErrorReason::BadState,
                "session is going away",
            );
            return Ok(());
        }
        if self.next_stream_id > MAX_STREAM_ID {
            self.context.owner.error(
                Some(request.stream),
                ErrorReason::StreamReset,
                "stream ids exhausted",
            );
            return Err(Error::ConnectionClosed);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut headers: Headers = vec![
            (":method".into(), request.method.clone()),
            (":path".into(), request.path.clone()),
            (":version".into(), "HTTP/1.1".into()),
            (":host".into(), request.authority.clone()),
            (
                ":scheme".into(),
                if self.context.secure { "https" } else { "http" }.into(),
            ),
        ];
        headers.extend(
            request
                .headers
                .iter()
                .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)))
                .cloned(),
        );

        let has_body = request.body.is_some();
        let local_fin = !has_body && !request.declares_body();
        self.send(&Frame::SynStream {
            stream_id,
            associated_id: 0,
            priority: 0,
            fin: local_fin,
            unidirectional: false,
            headers,
        })?;
        if let Some(body) = request.body {
            self.send_body(stream_id, true, body)?;
        }

        debug!(stream = %request.stream, stream_id, method = %request.method, path = %request.path, "SPDY stream opened");
        self.streams.insert(
            stream_id,
            SpdyStream {
                stream: request.stream,
                replied: false,
                local_fin: local_fin || has_body,
            },
        );
        self.ids.insert(request.stream, stream_id);
        Ok(())
    }

    fn data(&mut self, stream: StreamRef, is_fin: bool, data: Bytes) -> Result<()> {
        let open = self
            .ids
            .get(&stream)
            .copied()
            .filter(|id| self.streams.get(id).is_some_and(|s| !s.local_fin));
        let Some(stream_id) = open else {
            self.context.owner.error(
                Some(stream),
                ErrorReason::BadState,
                "stream is not sending a request body",
            );
            return Ok(());
        };

        self.send_body(stream_id, is_fin, data)?;
        if is_fin && let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.local_fin = true;
        }
        Ok(())
    }

    fn cancel(&mut self, stream: StreamRef) -> Result<()> {
        let Some(stream_id) = self.ids.get(&stream).copied() else {
            trace!(%stream, "Cancel for unknown stream ignored");
            return Ok(());
        };
        self.remove(stream_id);
        debug!(%stream, stream_id, "SPDY stream cancelled");
        self.send(&Frame::RstStream {
            stream_id,
            status: RstStatus::CANCEL,
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        self.send(&Frame::GoAway {
            last_stream_id: 0,
            status: 0,
        })
    }

    fn down(&mut self) -> Vec<StreamRef> {
        if !self.buffer.is_empty() {
            warn!(bytes = self.buffer.len(), "Discarding partial SPDY frame");
        }
        self.buffer.clear();
        self.ids.clear();
        let mut lost: Vec<(u32, StreamRef)> = self
            .streams
            .drain()
            .map(|(id, s)| (id, s.stream))
            .collect();
        lost.sort_unstable_by_key(|(id, _)| *id);
        lost.into_iter().map(|(_, stream)| stream).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
