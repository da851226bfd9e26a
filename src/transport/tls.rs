//! TLS connector.
//!
//! Advertises `spdy/3.1` and `http/1.1` over ALPN and hands the socket to
//! whichever backend the server picked. Servers that do not negotiate a
//! protocol get HTTP/1.1.
//!
//! SPDY name/value blocks are sent and expected without zlib compression,
//! so a session negotiated as `spdy/3.1` only works with peers that accept
//! uncompressed header blocks. A [`ClientConfig`] that already lists its own
//! ALPN protocols keeps them, so offering only `http/1.1` avoids SPDY with
//! other servers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::Protocol;

use super::tcp::connect_tcp;
use super::{Connector, Socket};

// ============================================================================
// TlsConnector
// ============================================================================

/// Connects over TLS.
///
/// `spdy/3.1` is offered ahead of `http/1.1`. Header blocks on a SPDY
/// session are not compressed; see the module docs.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("alpn", &self.config.alpn_protocols.len())
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Creates a connector from `config`, or from the platform's native
    /// roots when `None`.
    ///
    /// The default ALPN list is applied unless `config` already has one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if no native root certificate can be loaded.
    pub fn new(config: Option<Arc<ClientConfig>>) -> Result<Self> {
        let mut config = match config {
            Some(config) => (*config).clone(),
            None => native_config()?,
        };
        if config.alpn_protocols.is_empty() {
            config.alpn_protocols = Protocol::ALPN_PREFERENCE
                .iter()
                .map(|p| p.alpn_id().to_vec())
                .collect();
        }

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
        let domain = ServerName::try_from(host.to_owned())
            .map_err(|e| Error::tls(format!("invalid server name `{host}`: {e}")))?;

        let tcp = connect_tcp(host, port).await?;
        let stream = tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
            .connect(domain, tcp)
            .await
            .map_err(|e| Error::tls(format!("handshake with {host}:{port} failed: {e}")))?;

        let protocol = stream
            .get_ref()
            .1
            .alpn_protocol()
            .and_then(Protocol::from_alpn)
            .unwrap_or(Protocol::Http);

        debug!(host, port, %protocol, "TLS connected");
        Ok(Socket::spawn(stream, protocol))
    }
}

fn native_config() -> Result<ClientConfig> {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!(error = %error, "Failed to load a native certificate");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, ignored, "Loaded native root certificates");

    if roots.is_empty() {
        return Err(Error::tls("no native root certificates available"));
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

// ============================================================================
// Tests
// ============================================================================
