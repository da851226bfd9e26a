//! Transport layer.
//!
//! A [`Connector`] opens a byte stream to the remote host and wraps it in a
//! [`Socket`]. The socket splits the stream into a reader task and a writer
//! task so the connection actor never blocks on I/O:
//!
//! ```text
//! ┌──────────────┐  TransportEvent   ┌──────────────┐
//! │ reader task  │──────────────────►│              │
//! └──────────────┘                   │  connection  │
//! ┌──────────────┐  Outbound bytes   │    actor     │
//! │ writer task  │◄──────────────────│              │
//! └──────────────┘                   └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `tcp` | Plain TCP connector |
//! | `tls` | TLS connector with ALPN |

// ============================================================================
// Submodules
// ============================================================================

/// Plain TCP connector.
pub mod tcp;

/// TLS connector.
pub mod tls;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::options::{ConnectionType, Options};
use crate::protocol::Protocol;

pub use tcp::TcpConnector;
pub use tls::TlsConnector;

// ============================================================================
// Constants
// ============================================================================

/// Bytes reserved for each socket read.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long a graceful close waits for queued bytes to drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Connector
// ============================================================================

/// Opens sockets to a remote host.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns a connection or TLS error when the socket cannot be opened.
    async fn connect(&self, host: &str, port: u16) -> Result<Socket>;
}

/// Builds the connector matching the configured connection type.
///
/// # Errors
///
/// Returns [`Error::Tls`] if a TLS configuration cannot be assembled.
pub fn connector_for(options: &Options) -> Result<Arc<dyn Connector>> {
    Ok(match options.connection_type {
        ConnectionType::Tcp => Arc::new(TcpConnector::new(Protocol::Http)),
        ConnectionType::TcpSpdy => Arc::new(TcpConnector::new(Protocol::Spdy)),
        ConnectionType::Tls => Arc::new(TlsConnector::new(options.tls.clone())?),
    })
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Condition reported by a socket.
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes arrived.
    Data(Bytes),
    /// The peer closed the stream.
    Closed,
    /// Reading or writing failed.
    Error(io::Error),
}

// ============================================================================
// SocketWriter
// ============================================================================

/// Queued write instruction.
#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    Shutdown,
}

/// Cloneable handle for queueing bytes on a socket.
///
/// Sends never wait for the peer.
#[derive(Debug, Clone)]
pub struct SocketWriter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketWriter {
    /// Queues bytes for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the writer task has stopped.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Outbound::Data(bytes.into()))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Returns a writer whose queue is read directly by the caller.
    #[cfg(test)]
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

// ============================================================================
// Socket
// ============================================================================

/// An open connection to the remote host.
///
/// Dropping the socket aborts its I/O tasks.
pub struct Socket {
    writer: SocketWriter,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    protocol: Protocol,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Wraps a connected stream, spawning its reader and writer tasks.
    ///
    /// `protocol` is the application protocol negotiated for the stream.
    pub fn spawn<S>(stream: S, protocol: Protocol) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(Self::read_loop(read_half, event_tx.clone()));
        let writer_task = tokio::spawn(Self::write_loop(write_half, out_rx, event_tx));

        Self {
            writer: SocketWriter { tx: out_tx },
            events,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
            protocol,
        }
    }

    /// Returns a handle for queueing writes.
    #[inline]
    #[must_use]
    pub fn writer(&self) -> SocketWriter {
        self.writer.clone()
    }

    /// Returns the negotiated application protocol.
    #[inline]
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Waits for the next transport event.
    ///
    /// Returns `None` once both I/O tasks are gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Closes the socket immediately, discarding queued writes.
    pub fn close(mut self) {
        self.abort();
    }

    /// Flushes queued writes, shuts the stream down and closes the socket.
    pub async fn shutdown(mut self) {
        let _ = self.writer.tx.send(Outbound::Shutdown);

        if let Some(writer_task) = self.writer_task.take()
            && timeout(FLUSH_TIMEOUT, writer_task).await.is_err()
        {
            warn!("Timed out flushing socket on shutdown");
        }

        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }

    async fn read_loop<R>(mut reader: R, events: mpsc::UnboundedSender<TransportEvent>)
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            buffer.reserve(READ_BUFFER_SIZE);
            let event = match reader.read_buf(&mut buffer).await {
                Ok(0) => TransportEvent::Closed,
                Ok(n) => {
                    trace!(bytes = n, "Socket read");
                    TransportEvent::Data(buffer.split().freeze())
                }
                Err(e) => TransportEvent::Error(e),
            };

            let done = !matches!(event, TransportEvent::Data(_));
            if events.send(event).is_err() || done {
                break;
            }
        }

        debug!("Socket reader terminated");
    }

    async fn write_loop<W>(
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(instruction) = outbound.recv().await {
            match instruction {
                Outbound::Data(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        let _ = events.send(TransportEvent::Error(e));
                        break;
                    }
                }
                Outbound::Shutdown => {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }

        debug!("Socket writer terminated");
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
