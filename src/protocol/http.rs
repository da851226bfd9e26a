//! HTTP/1.1 backend.
//!
//! Requests are pipelined: each one is written as soon as the owner sends
//! it, and responses are matched to streams in request order. A cancelled
//! stream's response is still parsed off the wire so the streams behind it
//! stay in sync, but nothing is delivered for it.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{ErrorReason, Headers};
use crate::identifiers::StreamRef;

use super::{Backend, BackendContext, Handshake, Protocol, Request};

// ============================================================================
// Constants
// ============================================================================

/// Largest response head accepted.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest chunk-size or trailer line accepted.
const MAX_LINE_SIZE: usize = 8 * 1024;

// ============================================================================
// Types
// ============================================================================

/// A request waiting for its response.
#[derive(Debug)]
struct PendingStream {
    stream: StreamRef,
    is_head: bool,
    cancelled: bool,
}

/// Request body currently being streamed through `data`.
#[derive(Debug)]
enum Outgoing {
    Idle,
    Length { stream: StreamRef, remaining: u64 },
    Chunked { stream: StreamRef },
}

impl Outgoing {
    fn stream(&self) -> Option<StreamRef> {
        match self {
            Self::Idle => None,
            Self::Length { stream, .. } | Self::Chunked { stream } => Some(*stream),
        }
    }
}

/// Where the response parser is.
#[derive(Debug, Clone, Copy)]
enum Incoming {
    Head,
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    /// Returns the first value of header `name`.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

// ============================================================================
// HttpBackend
// ============================================================================

/// HTTP/1.1 protocol backend.
#[derive(Debug)]
pub struct HttpBackend {
    context: BackendContext,
    buffer: BytesMut,
    streams: VecDeque<PendingStream>,
    outgoing: Outgoing,
    incoming: Incoming,
}

impl HttpBackend {
    /// Creates a backend for a fresh socket.
    #[must_use]
    pub fn new(context: BackendContext) -> Self {
        Self {
            context,
            buffer: BytesMut::new(),
            streams: VecDeque::new(),
            outgoing: Outgoing::Idle,
            incoming: Incoming::Head,
        }
    }

    /// Makes one unit of parsing progress. Returns `false` when more input
    /// is needed.
    fn step(&mut self) -> Result<bool> {
        match self.incoming {
            Incoming::Head => self.step_head(),
            Incoming::Length(remaining) => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let n = remaining.min(self.buffer.len() as u64);
                let chunk = self.buffer.split_to(n as usize).freeze();
                let remaining = remaining - n;

                self.deliver_data(remaining == 0, chunk);
                if remaining == 0 {
                    self.finish_response();
                } else {
                    self.incoming = Incoming::Length(remaining);
                }
                Ok(true)
            }
            Incoming::Chunked(state) => self.step_chunked(state),
            Incoming::UntilClose => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let chunk = self.buffer.split().freeze();
                self.deliver_data(false, chunk);
                Ok(true)
            }
        }
    }

    fn step_head(&mut self) -> Result<bool> {
        let Some((head, consumed)) = parse_head(&self.buffer)? else {
            return Ok(false);
        };
        self.buffer.advance(consumed);

        let Some(current) = self.streams.front() else {
            return Err(Error::protocol("response received with no request outstanding"));
        };

        if head.status == 101 {
            return Err(Error::protocol("unexpected 101 Switching Protocols"));
        }
        if (100..200).contains(&head.status) {
            trace!(status = head.status, "Skipping informational response");
            return Ok(true);
        }

        let body = if current.is_head || head.status == 204 || head.status == 304 {
            None
        } else if head
            .header("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            Some(Incoming::Chunked(ChunkState::Size))
        } else if let Some(length) = head.header("content-length") {
            let length: u64 = length
                .parse()
                .map_err(|_| Error::protocol(format!("invalid content-length `{length}`")))?;
            (length > 0).then_some(Incoming::Length(length))
        } else {
            Some(Incoming::UntilClose)
        };

        if !current.cancelled {
            self.context
                .owner
                .response(current.stream, body.is_none(), head.status, head.headers);
        }

        match body {
            Some(incoming) => self.incoming = incoming,
            None => self.finish_response(),
        }
        Ok(true)
    }

    fn step_chunked(&mut self, state: ChunkState) -> Result<bool> {
        match state {
            ChunkState::Size => {
                let Some(line) = self.take_line()? else {
                    return Ok(false);
                };
                let size = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size, 16)
                    .map_err(|_| Error::protocol(format!("invalid chunk size `{size}`")))?;

                self.incoming = Incoming::Chunked(if size == 0 {
                    ChunkState::Trailers
                } else {
                    ChunkState::Data(size)
                });
            }
            ChunkState::Data(remaining) => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let n = remaining.min(self.buffer.len() as u64);
                let chunk = self.buffer.split_to(n as usize).freeze();
                self.deliver_data(false, chunk);

                let remaining = remaining - n;
                self.incoming = Incoming::Chunked(if remaining == 0 {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data(remaining)
                });
            }
            ChunkState::DataEnd => {
                if self.buffer.len() < 2 {
                    return Ok(false);
                }
                if &self.buffer[..2] != b"\r\n" {
                    return Err(Error::protocol("chunk data not followed by CRLF"));
                }
                self.buffer.advance(2);
                self.incoming = Incoming::Chunked(ChunkState::Size);
            }
            ChunkState::Trailers => {
                let Some(line) = self.take_line()? else {
                    return Ok(false);
                };
                if line.is_empty() {
                    self.deliver_data(true, Bytes::new());
                    self.finish_response();
                }
            }
        }
        Ok(true)
    }

    /// Removes one CRLF-terminated line from the buffer.
    fn take_line(&mut self) -> Result<Option<String>> {
        let Some(end) = find(&self.buffer, b"\r\n") else {
            if self.buffer.len() > MAX_LINE_SIZE {
                return Err(Error::protocol("chunk line too long"));
            }
            return Ok(None);
        };
        let line = String::from_utf8(self.buffer[..end].to_vec())
            .map_err(|_| Error::protocol("chunk line is not valid UTF-8"))?;
        self.buffer.advance(end + 2);
        Ok(Some(line))
    }

    fn deliver_data(&self, is_fin: bool, data: Bytes) {
        if let Some(current) = self.streams.front()
            && !current.cancelled
        {
            self.context.owner.data(current.stream, is_fin, data);
        }
    }

    fn finish_response(&mut self) {
        self.streams.pop_front();
        self.incoming = Incoming::Head;
    }

    fn write_request_line(&self, buf: &mut BytesMut, method: &str, path: &str, headers: &Headers) {
        buf.put_slice(method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("host")) {
            write_header(buf, "host", &self.context.authority);
        }
        for (name, value) in headers {
            write_header(buf, name, value);
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

impl Backend for HttpBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn handle(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        while self.step()? {}
        Ok(())
    }

    fn keepalive(&mut self) -> Result<()> {
        Ok(())
    }

    fn request(&mut self, request: Request) -> Result<()> {
        if let Some(busy) = self.outgoing.stream() {
            self.context.owner.error(
                Some(request.stream),
                ErrorReason::BadState,
                format!("request body of stream {busy} is still being sent"),
            );
            return Ok(());
        }

        let declared_length = request.headers.iter().find_map(|(name, value)| {
            name.eq_ignore_ascii_case("content-length").then_some(value)
        });
        let chunked = request.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        });

        let outgoing = match (&request.body, declared_length) {
            (Some(_), _) => Outgoing::Idle,
            (None, _) if chunked => Outgoing::Chunked {
                stream: request.stream,
            },
            (None, Some(length)) => match length.trim().parse::<u64>() {
                Ok(0) => Outgoing::Idle,
                Ok(remaining) => Outgoing::Length {
                    stream: request.stream,
                    remaining,
                },
                Err(_) => {
                    self.context.owner.error(
                        Some(request.stream),
                        ErrorReason::BadState,
                        format!("invalid content-length `{length}`"),
                    );
                    return Ok(());
                }
            },
            (None, None) => Outgoing::Idle,
        };

        let mut buf = BytesMut::with_capacity(256);
        self.write_request_line(&mut buf, &request.method, &request.path, &request.headers);
        if let Some(body) = &request.body {
            if declared_length.is_none() {
                write_header(&mut buf, "content-length", &body.len().to_string());
            }
            buf.put_slice(b"\r\n");
            buf.put_slice(body);
        } else {
            buf.put_slice(b"\r\n");
        }

        self.context.socket.send(buf.freeze())?;
        debug!(stream = %request.stream, method = %request.method, path = %request.path, "HTTP request sent");

        self.outgoing = outgoing;
        self.streams.push_back(PendingStream {
            stream: request.stream,
            is_head: request.method.eq_ignore_ascii_case("HEAD"),
            cancelled: false,
        });
        Ok(())
    }

    fn data(&mut self, stream: StreamRef, is_fin: bool, data: Bytes) -> Result<()> {
        match &mut self.outgoing {
            Outgoing::Length {
                stream: current,
                remaining,
            } if *current == stream => {
                let len = data.len() as u64;
                if len > *remaining {
                    self.context.owner.error(
                        Some(stream),
                        ErrorReason::BadState,
                        "body exceeds the declared content-length",
                    );
                    return Ok(());
                }
                *remaining -= len;
                let done = *remaining == 0;
                if is_fin && !done {
                    warn!(%stream, "Request body finished short of its content-length");
                }

                self.context.socket.send(data)?;
                if is_fin || done {
                    self.outgoing = Outgoing::Idle;
                }
            }
            Outgoing::Chunked { stream: current } if *current == stream => {
                let mut buf = BytesMut::with_capacity(data.len() + 16);
                if !data.is_empty() {
                    let mut size = String::new();
                    let _ = write!(size, "{:x}\r\n", data.len());
                    buf.put_slice(size.as_bytes());
                    buf.put_slice(&data);
                    buf.put_slice(b"\r\n");
                }
                if is_fin {
                    buf.put_slice(b"0\r\n\r\n");
                    self.outgoing = Outgoing::Idle;
                }
                if !buf.is_empty() {
                    self.context.socket.send(buf.freeze())?;
                }
            }
            _ => {
                self.context.owner.error(
                    Some(stream),
                    ErrorReason::BadState,
                    "stream is not sending a request body",
                );
            }
        }
        Ok(())
    }

    fn cancel(&mut self, stream: StreamRef) -> Result<()> {
        match self.streams.iter_mut().find(|s| s.stream == stream) {
            Some(pending) => {
                pending.cancelled = true;
                debug!(%stream, "HTTP stream cancelled");
            }
            None => trace!(%stream, "Cancel for unknown stream ignored"),
        }
        Ok(())
    }

    fn ws_upgrade(&mut self, path: &str, headers: Headers) -> Result<Handshake> {
        if let Some(busy) = self.outgoing.stream() {
            return Err(Error::bad_state(format!(
                "request body of stream {busy} is still being sent"
            )));
        }

        let handshake = Handshake::new(&self.context, path, headers)?;
        debug!(path, "WebSocket upgrade requested");
        Ok(handshake)
    }

    fn down(&mut self) -> Vec<StreamRef> {
        if matches!(self.incoming, Incoming::UntilClose) {
            self.deliver_data(true, Bytes::new());
            self.finish_response();
        }

        self.buffer.clear();
        self.outgoing = Outgoing::Idle;
        self.incoming = Incoming::Head;
        self.streams
            .drain(..)
            .filter(|s| !s.cancelled)
            .map(|s| s.stream)
            .collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn write_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// Finds the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parses a response head.
///
/// Returns the head and the number of bytes it occupied, or `None` if the
/// blank line has not arrived yet. Header names are lowercased.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let Some(end) = find(buf, b"\r\n\r\n") else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::protocol("response head too large"));
        }
        return Ok(None);
    };

    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::protocol("response head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
        return Err(Error::protocol(format!("invalid status line `{status_line}`")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or_else(|| Error::protocol(format!("invalid status line `{status_line}`")))?;

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header line `{line}`")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }

    Ok(Some((ResponseHead { status, headers }, end + 4)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::event::{Event, Notifier};
    use crate::transport::{Outbound, SocketWriter};

    fn backend() -> (
        HttpBackend,
        UnboundedReceiver<Event>,
        UnboundedReceiver<Outbound>,
    ) {
        let (owner, events) = Notifier::channel();
        let (socket, out) = SocketWriter::pair();
        let context = BackendContext {
            owner,
            socket,
            authority: "example.com".into(),
            secure: false,
        };
        (HttpBackend::new(context), events, out)
    }

    fn request(method: &str, path: &str, headers: Headers, body: Option<&'static [u8]>) -> Request {
        Request {
            stream: StreamRef::generate(),
            method: method.into(),
            authority: "example.com".into(),
            path: path.into(),
            headers,
            body: body.map(Bytes::from_static),
        }
    }

    fn written(out: &mut UnboundedReceiver<Outbound>) -> String {
        let mut text = String::new();
        while let Ok(Outbound::Data(bytes)) = out.try_recv() {
            text.push_str(std::str::from_utf8(&bytes).unwrap());
        }
        text
    }

    fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut all = Vec::new();
        while let Ok(event) = events.try_recv() {
            all.push(event);
        }
        all
    }

    #[test]
    fn test_get_request_encoding() {
        let (mut http, _events, mut out) = backend();
        http.request(request("GET", "/index.html", vec![("accept".into(), "*/*".into())], None))
            .unwrap();

        assert_eq!(
            written(&mut out),
            "GET /index.html HTTP/1.1\r\nhost: example.com\r\naccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_body_adds_content_length() {
        let (mut http, _events, mut out) = backend();
        http.request(request("POST", "/submit", vec![], Some(b"abc"))).unwrap();

        assert_eq!(
            written(&mut out),
            "POST /submit HTTP/1.1\r\nhost: example.com\r\ncontent-length: 3\r\n\r\nabc"
        );
    }

    #[test]
    fn test_content_length_response() {
        let (mut http, mut events, _out) = backend();
        let req = request("GET", "/", vec![], None);
        let stream = req.stream;
        http.request(req).unwrap();

        http.handle(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: test\r\n\r\nhel")
            .unwrap();
        http.handle(b"lo").unwrap();

        let all = drain(&mut events);
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[0],
            Event::Response {
                stream,
                is_fin: false,
                status: 200,
                headers: vec![
                    ("content-length".into(), "5".into()),
                    ("server".into(), "test".into()),
                ],
            }
        );
        assert_eq!(
            all[1],
            Event::Data { stream, is_fin: false, data: Bytes::from_static(b"hel") }
        );
        assert_eq!(
            all[2],
            Event::Data { stream, is_fin: true, data: Bytes::from_static(b"lo") }
        );
    }

    #[test]
    fn test_head_split_across_reads() {
        let (mut http, mut events, _out) = backend();
        http.request(request("GET", "/", vec![], None)).unwrap();

        http.handle(b"HTTP/1.1 204 No").unwrap();
        assert!(drain(&mut events).is_empty());

        http.handle(b" Content\r\n\r\n").unwrap();
        let all = drain(&mut events);
        assert!(matches!(all[..], [Event::Response { is_fin: true, status: 204, .. }]));
    }

    #[test]
    fn test_chunked_response() {
        let (mut http, mut events, _out) = backend();
        let req = request("GET", "/", vec![], None);
        let stream = req.stream;
        http.request(req).unwrap();

        http.handle(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nx-trailer: 1\r\n\r\n",
        )
        .unwrap();

        let all = drain(&mut events);
        assert_eq!(all.len(), 4);
        assert!(matches!(all[0], Event::Response { is_fin: false, .. }));
        assert_eq!(
            all[1],
            Event::Data { stream, is_fin: false, data: Bytes::from_static(b"hello") }
        );
        assert_eq!(
            all[2],
            Event::Data { stream, is_fin: false, data: Bytes::from_static(b" world") }
        );
        assert_eq!(all[3], Event::Data { stream, is_fin: true, data: Bytes::new() });
    }

    #[test]
    fn test_head_request_has_no_body() {
        let (mut http, mut events, _out) = backend();
        http.request(request("HEAD", "/", vec![], None)).unwrap();
        http.request(request("GET", "/", vec![], None)).unwrap();

        http.handle(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();

        let all = drain(&mut events);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|e| matches!(e, Event::Response { is_fin: true, .. })));
    }

    #[test]
    fn test_pipelined_responses_match_request_order() {
        let (mut http, mut events, _out) = backend();
        let first = request("GET", "/a", vec![], None);
        let second = request("GET", "/b", vec![], None);
        let (a, b) = (first.stream, second.stream);
        http.request(first).unwrap();
        http.request(second).unwrap();

        http.handle(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nAHTTP/1.1 404 Not Found\r\ncontent-length: 1\r\n\r\nB")
            .unwrap();

        let streams: Vec<_> = drain(&mut events).iter().filter_map(Event::stream).collect();
        assert_eq!(streams, vec![a, a, b, b]);
    }

    #[test]
    fn test_informational_response_skipped() {
        let (mut http, mut events, _out) = backend();
        http.request(request("POST", "/", vec![], Some(b"x"))).unwrap();

        http.handle(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n")
            .unwrap();

        let all = drain(&mut events);
        assert!(matches!(all[..], [Event::Response { status: 201, is_fin: true, .. }]));
    }

    #[test]
    fn test_cancel_before_response_is_accepted() {
        let (mut http, mut events, _out) = backend();
        let req = request("GET", "/", vec![], None);
        let stream = req.stream;
        http.request(req).unwrap();

        assert!(http.cancel(stream).is_ok());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_cancelled_response_is_consumed_silently() {
        let (mut http, mut events, _out) = backend();
        let first = request("GET", "/a", vec![], None);
        let second = request("GET", "/b", vec![], None);
        let (a, b) = (first.stream, second.stream);
        http.request(first).unwrap();
        http.request(second).unwrap();
        http.cancel(a).unwrap();

        http.handle(b"HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nabcHTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nxy")
            .unwrap();

        let all = drain(&mut events);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|e| e.stream() == Some(b)));
    }

    #[test]
    fn test_response_without_request_is_protocol_error() {
        let (mut http, _events, _out) = backend();
        let err = http.handle(b"HTTP/1.1 200 OK\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_garbage_status_line_is_protocol_error() {
        let (mut http, _events, _out) = backend();
        http.request(request("GET", "/", vec![], None)).unwrap();
        assert!(http.handle(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    #[test]
    fn test_body_until_close_finishes_on_down() {
        let (mut http, mut events, _out) = backend();
        let req = request("GET", "/", vec![], None);
        let stream = req.stream;
        http.request(req).unwrap();

        http.handle(b"HTTP/1.0 200 OK\r\n\r\nstreamed").unwrap();
        let lost = http.down();

        assert!(lost.is_empty());
        let all = drain(&mut events);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], Event::Data { stream, is_fin: true, data: Bytes::new() });
    }

    #[test]
    fn test_down_returns_inflight_streams() {
        let (mut http, _events, _out) = backend();
        let first = request("GET", "/a", vec![], None);
        let second = request("GET", "/b", vec![], None);
        let (a, b) = (first.stream, second.stream);
        http.request(first).unwrap();
        http.request(second).unwrap();
        http.cancel(b).unwrap();

        assert_eq!(http.down(), vec![a]);
        assert!(http.down().is_empty());
    }

    #[test]
    fn test_streamed_chunked_body() {
        let (mut http, mut events, mut out) = backend();
        let req = request(
            "POST",
            "/upload",
            vec![("transfer-encoding".into(), "chunked".into())],
            None,
        );
        let stream = req.stream;
        http.request(req).unwrap();
        written(&mut out);

        http.data(stream, false, Bytes::from_static(b"hello world")).unwrap();
        http.data(stream, true, Bytes::new()).unwrap();

        assert_eq!(written(&mut out), "b\r\nhello world\r\n0\r\n\r\n");
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_streamed_length_body() {
        let (mut http, mut events, mut out) = backend();
        let req = request("PUT", "/", vec![("content-length".into(), "4".into())], None);
        let stream = req.stream;
        http.request(req).unwrap();
        written(&mut out);

        http.data(stream, false, Bytes::from_static(b"ab")).unwrap();
        http.data(stream, true, Bytes::from_static(b"cd")).unwrap();
        assert_eq!(written(&mut out), "abcd");

        http.data(stream, true, Bytes::from_static(b"more")).unwrap();
        assert!(matches!(
            drain(&mut events)[..],
            [Event::Error { reason: ErrorReason::BadState, .. }]
        ));
    }

    #[test]
    fn test_request_while_body_pending_is_rejected() {
        let (mut http, mut events, mut out) = backend();
        http.request(request("PUT", "/", vec![("content-length".into(), "4".into())], None))
            .unwrap();
        written(&mut out);

        let next = request("GET", "/", vec![], None);
        let next_stream = next.stream;
        http.request(next).unwrap();

        assert!(written(&mut out).is_empty());
        let all = drain(&mut events);
        assert_eq!(all[0].stream(), Some(next_stream));
        assert_eq!(all[0].error_reason(), Some(ErrorReason::BadState));
    }

    #[test]
    fn test_ws_upgrade_request() {
        let (mut http, _events, mut out) = backend();
        let handshake = http
            .ws_upgrade("/chat", vec![("origin".into(), "http://example.com".into())])
            .unwrap();

        assert!(written(&mut out).is_empty());
        assert!(!handshake.key().is_empty());
        assert_eq!(handshake.expected_accept().len(), 28);
    }

    #[test]
    fn test_ws_upgrade_while_sending_body_is_bad_state() {
        let (mut http, _events, _out) = backend();
        http.request(request(
            "POST",
            "/upload",
            vec![("content-length".into(), "4".into())],
            None,
        ))
        .unwrap();

        let err = http.ws_upgrade("/chat", vec![]).unwrap_err();
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_parse_head_lowercases_names() {
        let (head, consumed) = parse_head(b"HTTP/1.1 301 Moved\r\nLocation: /x\r\n\r\nrest")
            .unwrap()
            .unwrap();
        assert_eq!(consumed, 36);
        assert_eq!(head.status, 301);
        assert_eq!(head.header("location"), Some("/x"));
    }
}
