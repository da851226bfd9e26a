//! Connection supervisor.
//!
//! Starts connection actors, keeps track of the running ones and records
//! how each one ended. Abnormal exits are logged at `error` level.
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │              Supervisor               │
//! │  ConnectionId=a → actor task + monitor│
//! │  ConnectionId=b → actor task + monitor│
//! └───────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

use crate::connection::actor::{Actor, ActorConfig};
use crate::connection::{Connection, Control, Events, Wiring};
use crate::error::{Error, Result};
use crate::event::Notifier;
use crate::identifiers::{CallerId, ConnectionId};
use crate::options::Options;
use crate::transport::Connector;

// ============================================================================
// ExitStatus
// ============================================================================

/// How a connection actor ended.
#[derive(Debug, Clone)]
pub enum ExitStatus {
    /// Shut down on request.
    Normal,
    /// Stopped with [`Connection::close`].
    Killed,
    /// Gave up, failed to start, or panicked.
    Failed(Arc<Error>),
}

impl ExitStatus {
    /// Returns `true` for a requested shutdown.
    #[inline]
    #[must_use]
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug)]
struct Child {
    abort: AbortHandle,
    control: mpsc::UnboundedSender<Control>,
    host: String,
    port: u16,
}

/// Running connections by id.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    children: Arc<RwLock<FxHashMap<ConnectionId, Child>>>,
}

impl Supervisor {
    /// Creates an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide supervisor used by [`crate::open`].
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Supervisor> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Validates `options` and starts a connection to `host:port`.
    ///
    /// Returns the owner's handle and its notification channel. The actor
    /// starts connecting immediately.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOption`] if an option or the host is invalid
    /// - [`Error::Internal`] if called outside a tokio runtime
    pub fn open(
        &self,
        host: impl Into<String>,
        port: u16,
        options: Options,
    ) -> Result<(Connection, Events)> {
        self.spawn(host.into(), port, options, None)
    }

    /// Like [`open`](Self::open), with a caller-supplied connector.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_connector(
        &self,
        host: impl Into<String>,
        port: u16,
        options: Options,
        connector: Arc<dyn Connector>,
    ) -> Result<(Connection, Events)> {
        self.spawn(host.into(), port, options, Some(connector))
    }

    /// Aborts a connection. Returns `false` if it was not running.
    pub fn terminate(&self, id: ConnectionId) -> bool {
        match self.children.read().get(&id) {
            Some(child) => {
                info!(%id, host = %child.host, port = child.port, "Terminating connection");
                child.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Suspends every running connection.
    pub fn suspend_all(&self) {
        for child in self.children.read().values() {
            let _ = child.control.send(Control::Suspend);
        }
    }

    /// Resumes every running connection.
    pub fn resume_all(&self) {
        for child in self.children.read().values() {
            let _ = child.control.send(Control::Resume);
        }
    }

    /// Returns the ids of running connections.
    #[must_use]
    pub fn children(&self) -> Vec<ConnectionId> {
        self.children.read().keys().copied().collect()
    }

    /// Returns the number of running connections.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.children.read().len()
    }

    fn spawn(
        &self,
        host: String,
        port: u16,
        options: Options,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<(Connection, Events)> {
        options.validate()?;
        if host.is_empty() {
            return Err(Error::invalid_option("host", "must not be empty"));
        }
        let runtime = Handle::try_current()
            .map_err(|_| Error::internal("connections must be opened inside a tokio runtime"))?;

        let id = ConnectionId::generate();
        let owner = CallerId::generate();
        let authority = authority(&host, port, &options);
        let (notifier, events) = Notifier::channel();
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let actor = Actor::new(ActorConfig {
            id,
            host: host.clone(),
            port,
            authority: authority.clone(),
            options,
            owner,
            notifier,
            mailbox: mailbox_rx,
            control: control_rx,
        });

        // Registered before the monitor exists so it always finds its entry.
        let task = runtime.spawn(actor.run(connector));
        self.children.write().insert(
            id,
            Child {
                abort: task.abort_handle(),
                control: control_tx.clone(),
                host,
                port,
            },
        );
        runtime.spawn(self.clone().monitor(id, task, exit_tx));
        debug!(%id, "Connection spawned");

        let connection = Connection::new(Wiring {
            id,
            authority,
            owner,
            mailbox: mailbox_tx,
            control: control_tx,
            exit: exit_rx,
            supervisor: self.clone(),
        });
        Ok((connection, events))
    }

    async fn monitor(
        self,
        id: ConnectionId,
        task: JoinHandle<Result<()>>,
        exit: watch::Sender<Option<ExitStatus>>,
    ) {
        let status = match task.await {
            Ok(Ok(())) => ExitStatus::Normal,
            Ok(Err(e)) => {
                error!(%id, error = %e, "Connection failed");
                ExitStatus::Failed(Arc::new(e))
            }
            Err(e) if e.is_cancelled() => {
                debug!(%id, "Connection killed");
                ExitStatus::Killed
            }
            Err(e) => {
                error!(%id, error = %e, "Connection panicked");
                ExitStatus::Failed(Arc::new(Error::internal(format!(
                    "connection task panicked: {e}"
                ))))
            }
        };

        self.children.write().remove(&id);
        exit.send_replace(Some(status));
    }
}

/// `host[:port]` as sent in request headers. The port is omitted when it is
/// the default for the connection type.
fn authority(host: &str, port: u16, options: &Options) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    };
    if port == options.connection_type.default_port() {
        host
    } else {
        format!("{host}:{port}")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::options::ConnectionType;
    use crate::protocol::Protocol;
    use crate::transport::mock::{MockConnector, Plan};

    fn mock(fallback: Plan) -> (Arc<dyn Connector>, UnboundedReceiver<DuplexStream>) {
        let (connector, servers) = MockConnector::new(Protocol::Http, [], fallback);
        (Arc::new(connector), servers)
    }

    #[test]
    fn test_authority() {
        let tcp = Options::new().with_type(ConnectionType::Tcp);
        assert_eq!(authority("example.com", 80, &tcp), "example.com");
        assert_eq!(authority("example.com", 8080, &tcp), "example.com:8080");
        assert_eq!(authority("::1", 443, &Options::new()), "[::1]");
        assert_eq!(authority("::1", 8443, &Options::new()), "[::1]:8443");
    }

    #[test]
    fn test_open_outside_runtime_fails() {
        let err = Supervisor::new()
            .open("example.com", 443, Options::new())
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn test_invalid_options_start_nothing() {
        let supervisor = Supervisor::new();

        let err = supervisor
            .open("example.com", 80, Options::new().with_keepalive(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "keepalive"));

        let err = supervisor.open("", 80, Options::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "host"));

        assert_eq!(supervisor.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_tracked_until_exit() {
        let supervisor = Supervisor::new();
        let (connector, _servers) = mock(Plan::Accept);
        let (conn, _events) = supervisor
            .open_with_connector("example.com", 80, Options::new(), connector)
            .unwrap();

        assert_eq!(supervisor.children(), vec![conn.id()]);
        assert!(supervisor.terminate(conn.id()));
        assert!(matches!(conn.closed().await, ExitStatus::Killed));

        assert_eq!(supervisor.count(), 0);
        assert!(!supervisor.terminate(conn.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_exit_recorded() {
        let supervisor = Supervisor::new();
        let options = Options::new().with_retry(0);
        let (connector, _servers) = mock(Plan::Refuse);
        let (conn, _events) = supervisor
            .open_with_connector("example.com", 443, options, connector)
            .unwrap();

        match conn.closed().await {
            ExitStatus::Failed(e) => assert!(e.is_connection_error()),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert_eq!(supervisor.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_all() {
        let supervisor = Supervisor::new();
        let (connector, _servers) = mock(Plan::Accept);
        let (conn, _events) = supervisor
            .open_with_connector("example.com", 443, Options::new(), connector)
            .unwrap();

        supervisor.suspend_all();
        assert!(conn.describe().await.unwrap().suspended);
        supervisor.resume_all();
        assert!(!conn.describe().await.unwrap().suspended);
    }
}
