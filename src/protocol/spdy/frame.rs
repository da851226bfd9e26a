//! SPDY/3.1 frame encoding and decoding.
//!
//! Control frames carry an 8-byte header with the control bit set:
//! ```text
//! +----------------------------------+
//! |C| Version(15bits) | Type(16bits) |
//! +----------------------------------+
//! | Flags (8)  |  Length (24 bits)   |
//! +----------------------------------+
//! |               Data               |
//! +----------------------------------+
//! ```
//! Data frames clear the control bit and put the stream id in its place.
//!
//! Name/value header blocks are encoded without zlib compression.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::event::Headers;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Protocol version carried by control frames.
pub const VERSION: u16 = 3;

// Control frame types.
pub const TYPE_SYN_STREAM: u16 = 1;
pub const TYPE_SYN_REPLY: u16 = 2;
pub const TYPE_RST_STREAM: u16 = 3;
pub const TYPE_SETTINGS: u16 = 4;
pub const TYPE_PING: u16 = 6;
pub const TYPE_GOAWAY: u16 = 7;
pub const TYPE_HEADERS: u16 = 8;
pub const TYPE_WINDOW_UPDATE: u16 = 9;

// Flags.
pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;

/// Largest payload the 24-bit length field can describe.
pub const MAX_FRAME_LENGTH: u32 = 0x00ff_ffff;

const CONTROL_BIT: u32 = 0x8000_0000;
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

// ============================================================================
// Status codes
// ============================================================================

/// `RST_STREAM` status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStatus(pub u32);

impl RstStatus {
    pub const PROTOCOL_ERROR: Self = Self(1);
    pub const INVALID_STREAM: Self = Self(2);
    pub const REFUSED_STREAM: Self = Self(3);
    pub const UNSUPPORTED_VERSION: Self = Self(4);
    pub const CANCEL: Self = Self(5);
    pub const INTERNAL_ERROR: Self = Self(6);
    pub const FLOW_CONTROL_ERROR: Self = Self(7);
    pub const STREAM_IN_USE: Self = Self(8);
    pub const STREAM_ALREADY_CLOSED: Self = Self(9);
    pub const FRAME_TOO_LARGE: Self = Self(11);

    /// Returns the status name, or `"UNKNOWN"`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self.0 {
            1 => "PROTOCOL_ERROR",
            2 => "INVALID_STREAM",
            3 => "REFUSED_STREAM",
            4 => "UNSUPPORTED_VERSION",
            5 => "CANCEL",
            6 => "INTERNAL_ERROR",
            7 => "FLOW_CONTROL_ERROR",
            8 => "STREAM_IN_USE",
            9 => "STREAM_ALREADY_CLOSED",
            11 => "FRAME_TOO_LARGE",
            _ => "UNKNOWN",
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A SPDY/3.1 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Body bytes for a stream.
    Data {
        stream_id: u32,
        fin: bool,
        data: Bytes,
    },
    /// Opens a stream. Sent by us for requests, by servers for pushes.
    SynStream {
        stream_id: u32,
        associated_id: u32,
        priority: u8,
        fin: bool,
        unidirectional: bool,
        headers: Headers,
    },
    /// Response headers.
    SynReply {
        stream_id: u32,
        fin: bool,
        headers: Headers,
    },
    /// Abnormal stream termination.
    RstStream { stream_id: u32, status: RstStatus },
    /// Settings as `(id, value)` pairs; per-entry flags are dropped.
    Settings { entries: Vec<(u32, u32)> },
    /// Liveness check. Client ids are odd, server ids even.
    Ping { id: u32 },
    /// Session shutdown.
    GoAway { last_stream_id: u32, status: u32 },
    /// Additional headers, e.g. trailers.
    Headers {
        stream_id: u32,
        fin: bool,
        headers: Headers,
    },
    /// Flow control credit.
    WindowUpdate { stream_id: u32, delta: u32 },
    /// Control frame of a type we do not handle.
    Unknown { frame_type: u16 },
}

impl Frame {
    /// Decodes one frame from the start of `buf`.
    ///
    /// Returns the frame and the bytes it occupied, or `None` if the frame
    /// is incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on a malformed frame or wrong version.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &buf[..FRAME_HEADER_LEN];
        let first = header.get_u32();
        let flags = header.get_u8();
        let length = (usize::from(header.get_u8()) << 16) | usize::from(header.get_u16());

        let total = FRAME_HEADER_LEN + length;
        if buf.len() < total {
            return Ok(None);
        }
        let mut payload = &buf[FRAME_HEADER_LEN..total];
        let fin = flags & FLAG_FIN != 0;

        if first & CONTROL_BIT == 0 {
            let frame = Self::Data {
                stream_id: first & STREAM_ID_MASK,
                fin,
                data: Bytes::copy_from_slice(payload),
            };
            return Ok(Some((frame, total)));
        }

        let version = ((first >> 16) & 0x7fff) as u16;
        if version != VERSION {
            return Err(Error::protocol(format!("unsupported SPDY version {version}")));
        }
        let frame_type = (first & 0xffff) as u16;

        let frame = match frame_type {
            TYPE_SYN_STREAM => {
                need(payload, 10, "SYN_STREAM")?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let associated_id = payload.get_u32() & STREAM_ID_MASK;
                let priority = payload.get_u8() >> 5;
                payload.advance(1);
                Self::SynStream {
                    stream_id,
                    associated_id,
                    priority,
                    fin,
                    unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
                    headers: decode_headers(payload)?,
                }
            }
            TYPE_SYN_REPLY => {
                need(payload, 4, "SYN_REPLY")?;
                Self::SynReply {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    fin,
                    headers: decode_headers(payload)?,
                }
            }
            TYPE_RST_STREAM => {
                need(payload, 8, "RST_STREAM")?;
                Self::RstStream {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: RstStatus(payload.get_u32()),
                }
            }
            TYPE_SETTINGS => {
                need(payload, 4, "SETTINGS")?;
                let count = payload.get_u32() as usize;
                need(payload, count.saturating_mul(8), "SETTINGS")?;
                let entries = (0..count)
                    .map(|_| {
                        let id = payload.get_u32() & 0x00ff_ffff;
                        (id, payload.get_u32())
                    })
                    .collect();
                Self::Settings { entries }
            }
            TYPE_PING => {
                need(payload, 4, "PING")?;
                Self::Ping {
                    id: payload.get_u32(),
                }
            }
            TYPE_GOAWAY => {
                need(payload, 8, "GOAWAY")?;
                Self::GoAway {
                    last_stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: payload.get_u32(),
                }
            }
            TYPE_HEADERS => {
                need(payload, 4, "HEADERS")?;
                Self::Headers {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    fin,
                    headers: decode_headers(payload)?,
                }
            }
            TYPE_WINDOW_UPDATE => {
                need(payload, 8, "WINDOW_UPDATE")?;
                Self::WindowUpdate {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    delta: payload.get_u32() & STREAM_ID_MASK,
                }
            }
            other => Self::Unknown { frame_type: other },
        };

        Ok(Some((frame, total)))
    }

    /// Appends the encoded frame to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadState`] if the payload does not fit the 24-bit
    /// length field. Nothing is appended in that case.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Data {
                stream_id,
                fin,
                data,
            } => {
                let length = frame_length(data.len())?;
                buf.put_u32(stream_id & STREAM_ID_MASK);
                put_flags_length(buf, fin_flag(*fin), length);
                buf.put_slice(data);
            }
            Self::SynStream {
                stream_id,
                associated_id,
                priority,
                fin,
                unidirectional,
                headers,
            } => {
                let block = encode_headers(headers);
                let mut flags = fin_flag(*fin);
                if *unidirectional {
                    flags |= FLAG_UNIDIRECTIONAL;
                }
                put_control(buf, TYPE_SYN_STREAM, flags, 10 + block.len())?;
                buf.put_u32(stream_id & STREAM_ID_MASK);
                buf.put_u32(associated_id & STREAM_ID_MASK);
                buf.put_u8((priority & 0x07) << 5);
                buf.put_u8(0);
                buf.put_slice(&block);
            }
            Self::SynReply {
                stream_id,
                fin,
                headers,
            } => {
                let block = encode_headers(headers);
                put_control(buf, TYPE_SYN_REPLY, fin_flag(*fin), 4 + block.len())?;
                buf.put_u32(stream_id & STREAM_ID_MASK);
                buf.put_slice(&block);
            }
            Self::RstStream { stream_id, status } => {
                put_control(buf, TYPE_RST_STREAM, 0, 8)?;
                buf.put_u32(stream_id & STREAM_ID_MASK);
                buf.put_u32(status.0);
            }
            Self::Settings { entries } => {
                put_control(buf, TYPE_SETTINGS, 0, 4 + entries.len() * 8)?;
                buf.put_u32(entries.len() as u32);
                for (id, value) in entries {
                    buf.put_u32(id & 0x00ff_ffff);
                    buf.put_u32(*value);
                }
            }
            Self::Ping { id } => {
                put_control(buf, TYPE_PING, 0, 4)?;
                buf.put_u32(*id);
            }
            Self::GoAway {
                last_stream_id,
                status,
            } => {
                put_control(buf, TYPE_GOAWAY, 0, 8)?;
                buf.put_u32(last_stream_id & STREAM_ID_MASK);
                buf.put_u32(*status);
            }
            Self::Headers {
                stream_id,
                fin,
                headers,
            } => {
                let block = encode_headers(headers);
                put_control(buf, TYPE_HEADERS, fin_flag(*fin), 4 + block.len())?;
                buf.put_u32(stream_id & STREAM_ID_MASK);
                buf.put_slice(&block);
            }
            Self::WindowUpdate { stream_id, delta } => {
                put_control(buf, TYPE_WINDOW_UPDATE, 0, 8)?;
                buf.put_u32(stream_id & STREAM_ID_MASK);
                buf.put_u32(delta & STREAM_ID_MASK);
            }
            Self::Unknown { frame_type } => {
                put_control(buf, *frame_type, 0, 0)?;
            }
        }
        Ok(())
    }

    /// Encodes the frame into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`Frame::encode`].
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

// ============================================================================
// Helpers
// ============================================================================

const fn fin_flag(fin: bool) -> u8 {
    if fin { FLAG_FIN } else { 0 }
}

fn frame_length(length: usize) -> Result<u32> {
    u32::try_from(length)
        .ok()
        .filter(|length| *length <= MAX_FRAME_LENGTH)
        .ok_or_else(|| {
            Error::bad_state(format!(
                "frame payload of {length} bytes exceeds {MAX_FRAME_LENGTH}"
            ))
        })
}

fn put_control(buf: &mut BytesMut, frame_type: u16, flags: u8, length: usize) -> Result<()> {
    let length = frame_length(length)?;
    buf.put_u16(0x8000 | VERSION);
    buf.put_u16(frame_type);
    put_flags_length(buf, flags, length);
    Ok(())
}

fn put_flags_length(buf: &mut BytesMut, flags: u8, length: u32) {
    buf.put_u32(u32::from(flags) << 24 | length);
}

fn need(payload: &[u8], len: usize, frame: &str) -> Result<()> {
    if payload.len() < len {
        return Err(Error::protocol(format!("truncated {frame} frame")));
    }
    Ok(())
}

/// Encodes a name/value header block. Names are lowercased.
#[must_use]
pub fn encode_headers(headers: &Headers) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(headers.len() as u32);
    for (name, value) in headers {
        buf.put_u32(name.len() as u32);
        buf.put_slice(name.to_ascii_lowercase().as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    buf.freeze()
}

/// Decodes a name/value header block.
///
/// NUL-separated values become separate entries.
///
/// # Errors
///
/// Returns [`Error::Protocol`] on truncation or invalid UTF-8.
pub fn decode_headers(mut block: &[u8]) -> Result<Headers> {
    need(block, 4, "header block in")?;
    let count = block.get_u32() as usize;

    let mut headers = Headers::with_capacity(count.min(64));
    for _ in 0..count {
        let name = take_string(&mut block)?;
        let value = take_string(&mut block)?;
        for part in value.split('\0') {
            headers.push((name.clone(), part.to_owned()));
        }
    }
    Ok(headers)
}

fn take_string(block: &mut &[u8]) -> Result<String> {
    need(block, 4, "header block in")?;
    let len = block.get_u32() as usize;
    need(block, len, "header block in")?;
    let text = std::str::from_utf8(&block[..len])
        .map_err(|_| Error::protocol("header block is not valid UTF-8"))?
        .to_owned();
    block.advance(len);
    Ok(text)
}

// ============================================================================
// Tests
// ============================================================================
