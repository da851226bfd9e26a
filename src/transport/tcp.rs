//! Plain TCP connector.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Protocol;

use super::{Connector, Socket};

// ============================================================================
// TcpConnector
// ============================================================================

/// Connects over plain TCP.
///
/// Plain TCP has no negotiation, so the protocol is fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    protocol: Protocol,
}

impl TcpConnector {
    /// Creates a connector that speaks `protocol` on every socket.
    #[inline]
    #[must_use]
    pub const fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
        let stream = connect_tcp(host, port).await?;
        Ok(Socket::spawn(stream, self.protocol))
    }
}

/// Opens a TCP stream with `TCP_NODELAY` set.
pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::connection(format!("{host}:{port}: {e}")))?;
    stream.set_nodelay(true)?;

    debug!(host, port, "TCP connected");
    Ok(stream)
}

// ============================================================================
// Tests
// ============================================================================
