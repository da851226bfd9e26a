//! The connection actor.
//!
//! One task per connection owns the socket and the protocol backend. Owner
//! messages, socket events, the keepalive timer and supervision requests are
//! all serialized through the `select!` loop in [`Actor::serve`], so neither
//! the socket nor the backend needs a lock.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::{ErrorReason, Headers, Notifier};
use crate::identifiers::{CallerId, ConnectionId, StreamRef};
use crate::options::Options;
use crate::protocol::{self, Backend, BackendContext, Protocol, WsBackend};
use crate::transport::{Connector, Socket, TransportEvent, connector_for};

use super::{Control, ConnectionInfo, ConnectionState, Envelope, Message};

// ============================================================================
// Types
// ============================================================================

/// Everything an actor is started with.
#[derive(Debug)]
pub(crate) struct ActorConfig {
    pub id: ConnectionId,
    pub host: String,
    pub port: u16,
    pub authority: String,
    pub options: Options,
    pub owner: CallerId,
    pub notifier: Notifier,
    pub mailbox: mpsc::UnboundedReceiver<Envelope>,
    pub control: mpsc::UnboundedReceiver<Control>,
}

/// A connected socket and the backend speaking over it.
#[derive(Debug)]
struct Session {
    socket: Socket,
    backend: Box<dyn Backend>,
}

/// How a session ended.
enum Exit {
    Reconnect,
    Stop,
}

/// What the loop does after an owner message.
#[derive(Debug)]
enum Flow {
    Continue,
    Disconnect(Error),
    Stop,
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug)]
pub(crate) struct Actor {
    id: ConnectionId,
    host: String,
    port: u16,
    authority: String,
    options: Options,
    owner: CallerId,
    notifier: Notifier,
    mailbox: mpsc::UnboundedReceiver<Envelope>,
    control: mpsc::UnboundedReceiver<Control>,
    state: ConnectionState,
    retries_left: u32,
    protocol: Option<Protocol>,
    suspended: bool,
}

impl Actor {
    pub(crate) fn new(config: ActorConfig) -> Self {
        Self {
            id: config.id,
            host: config.host,
            port: config.port,
            authority: config.authority,
            retries_left: config.options.retry,
            options: config.options,
            owner: config.owner,
            notifier: config.notifier,
            mailbox: config.mailbox,
            control: config.control,
            state: ConnectionState::Connecting,
            protocol: None,
            suspended: false,
        }
    }

    /// Runs the actor until it is shut down or gives up connecting.
    ///
    /// Uses `connector` when given, otherwise builds one from the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] when every connect attempt
    /// failed, or the error that prevented startup.
    pub(crate) async fn run(mut self, connector: Option<Arc<dyn Connector>>) -> Result<()> {
        let connector = match connector.map_or_else(|| connector_for(&self.options), Ok) {
            Ok(connector) => connector,
            Err(e) => {
                self.notifier
                    .error(None, ErrorReason::Internal, format!("startup failed: {e}"));
                return Err(e);
            }
        };

        info!(
            id = %self.id,
            host = %self.host,
            port = self.port,
            connection_type = %self.options.connection_type,
            "Connection starting"
        );

        loop {
            self.hold().await;
            self.state = ConnectionState::Connecting;

            let socket = match self.attempt(&connector).await {
                Ok(socket) => socket,
                Err(e) if self.retries_left == 0 => {
                    let attempts = self.options.retry.saturating_add(1);
                    warn!(id = %self.id, error = %e, attempts, "Connect failed, no retries left");
                    self.notifier.error(
                        None,
                        ErrorReason::RetriesExhausted,
                        format!(
                            "gave up connecting to {}:{} after {attempts} attempts",
                            self.host, self.port
                        ),
                    );
                    return Err(Error::retries_exhausted(&self.host, self.port, attempts));
                }
                Err(e) => {
                    self.retries_left -= 1;
                    warn!(id = %self.id, error = %e, retries_left = self.retries_left, "Connect failed, retrying");
                    self.retry_wait().await;
                    continue;
                }
            };

            let session = match self.start(socket) {
                Ok(session) => session,
                Err(e) => {
                    self.notifier
                        .error(None, ErrorReason::Internal, format!("backend init failed: {e}"));
                    return Err(e);
                }
            };

            match self.serve(session).await {
                Exit::Reconnect => {
                    self.retries_left = self.options.retry;
                }
                Exit::Stop => {
                    info!(id = %self.id, "Connection stopped");
                    return Ok(());
                }
            }
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// One connect attempt, servicing supervision requests meanwhile.
    async fn attempt(&mut self, connector: &Arc<dyn Connector>) -> Result<Socket> {
        debug!(id = %self.id, retries_left = self.retries_left, "Connecting");
        let host = self.host.clone();
        let mut connect = connector.connect(&host, self.port);

        loop {
            tokio::select! {
                result = &mut connect => return result,
                Some(control) = self.control.recv() => self.on_control(control),
            }
        }
    }

    async fn retry_wait(&mut self) {
        self.state = ConnectionState::RetryWait;
        let timer = sleep(self.options.retry_timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = &mut timer => return,
                Some(control) = self.control.recv() => self.on_control(control),
            }
        }
    }

    fn start(&mut self, socket: Socket) -> Result<Session> {
        let protocol = socket.protocol();
        let backend = protocol::init(protocol, self.context(&socket))?;

        info!(id = %self.id, %protocol, "Connected");
        self.state = ConnectionState::Active;
        self.protocol = Some(protocol);
        Ok(Session { socket, backend })
    }

    fn context(&self, socket: &Socket) -> BackendContext {
        BackendContext {
            owner: self.notifier.clone(),
            socket: socket.writer(),
            authority: self.authority.clone(),
            secure: self.options.connection_type.is_secure(),
        }
    }

    // ========================================================================
    // Serving
    // ========================================================================

    async fn serve(&mut self, mut session: Session) -> Exit {
        let keepalive = self.options.keepalive;
        let timer = sleep(keepalive);
        tokio::pin!(timer);

        loop {
            self.hold().await;

            // Control first, so a suspend sent before a message takes hold
            // before that message is dispatched.
            tokio::select! {
                biased;

                Some(control) = self.control.recv() => self.on_control(control),

                event = session.socket.recv() => match event {
                    Some(TransportEvent::Data(bytes)) => {
                        if let Err(e) = session.backend.handle(&bytes) {
                            self.disconnect(session, &e.to_string());
                            return Exit::Reconnect;
                        }
                    }
                    Some(TransportEvent::Error(e)) => {
                        self.disconnect(session, &format!("socket error: {e}"));
                        return Exit::Reconnect;
                    }
                    Some(TransportEvent::Closed) | None => {
                        self.disconnect(session, "closed by peer");
                        return Exit::Reconnect;
                    }
                },

                () = &mut timer => {
                    trace!(id = %self.id, "Keepalive");
                    if let Err(e) = session.backend.keepalive() {
                        self.disconnect(session, &format!("keepalive failed: {e}"));
                        return Exit::Reconnect;
                    }
                    timer.as_mut().reset(Instant::now() + keepalive);
                },

                envelope = self.mailbox.recv() => {
                    let Some(envelope) = envelope else {
                        debug!(id = %self.id, "All handles dropped");
                        self.stop(session).await;
                        return Exit::Stop;
                    };
                    self.drain_control();
                    self.hold().await;
                    match self.dispatch(&mut session, envelope) {
                        Flow::Continue => {}
                        Flow::Disconnect(e) => {
                            self.disconnect(session, &e.to_string());
                            return Exit::Reconnect;
                        }
                        Flow::Stop => {
                            self.stop(session).await;
                            return Exit::Stop;
                        }
                    }
                },
            }
        }
    }

    fn dispatch(&mut self, session: &mut Session, envelope: Envelope) -> Flow {
        let Envelope {
            from,
            reply_to,
            message,
        } = envelope;
        let stream = message.stream();

        if from != self.owner {
            match reply_to {
                Some(reply_to) => reply_to.error(
                    stream,
                    ErrorReason::NotOwner,
                    "only the owner may use this connection",
                ),
                None => debug!(id = %self.id, caller = %from, "Ignoring message from non-owner"),
            }
            return Flow::Continue;
        }

        let result = match message {
            Message::Request(request) => session.backend.request(request),
            Message::Data {
                stream,
                is_fin,
                data,
            } => session.backend.data(stream, is_fin, data),
            Message::Cancel(stream) => session.backend.cancel(stream),
            Message::WsUpgrade { path, headers } => self.upgrade(session, &path, headers),
            Message::WsSend(frames) => session.backend.ws_send(frames),
            Message::Shutdown => return Flow::Stop,
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(e) => self.on_failure(stream, e),
        }
    }

    /// Decides what a failed owner message does to the session.
    ///
    /// Usage errors go back to the owner. Socket and protocol failures drop
    /// the session for a reconnect. Anything else is also reported to the
    /// owner as internal before the session is dropped.
    fn on_failure(&self, stream: Option<StreamRef>, e: Error) -> Flow {
        if e.is_usage_error() {
            debug!(id = %self.id, error = %e, "Rejected owner message");
            self.notifier.error(stream, ErrorReason::BadState, e.to_string());
            return Flow::Continue;
        }
        if !e.is_recoverable() {
            error!(id = %self.id, error = %e, "Owner message failed");
            self.notifier.error(stream, ErrorReason::Internal, e.to_string());
        }
        Flow::Disconnect(e)
    }

    /// Hands the socket over to a WebSocket backend.
    fn upgrade(&mut self, session: &mut Session, path: &str, headers: Headers) -> Result<()> {
        let handshake = session.backend.ws_upgrade(path, headers)?;

        let ws = WsBackend::new(self.context(&session.socket), handshake)?;
        let mut previous = std::mem::replace(&mut session.backend, Box::new(ws));
        for stream in previous.down() {
            self.notifier.error(
                Some(stream),
                ErrorReason::StreamReset,
                "connection upgraded to WebSocket",
            );
        }

        info!(id = %self.id, path, "Upgrading to WebSocket");
        self.state = ConnectionState::WsActive;
        self.protocol = Some(Protocol::Ws);
        Ok(())
    }

    /// Drops the socket. Streams that were in flight learn they are lost.
    fn disconnect(&mut self, session: Session, reason: &str) {
        let Session {
            socket,
            mut backend,
        } = session;

        warn!(id = %self.id, reason, "Connection lost");
        for stream in backend.down() {
            self.notifier.error(
                Some(stream),
                ErrorReason::ConnectionLost,
                format!("connection lost: {reason}"),
            );
        }
        socket.close();
        self.protocol = None;
    }

    async fn stop(&mut self, session: Session) {
        let Session {
            socket,
            mut backend,
        } = session;

        if let Err(e) = backend.shutdown() {
            debug!(id = %self.id, error = %e, "Backend shutdown failed");
        }
        socket.shutdown().await;
        self.protocol = None;
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    /// Blocks while suspended, servicing only supervision requests.
    async fn hold(&mut self) {
        while self.suspended {
            match self.control.recv().await {
                Some(control) => self.on_control(control),
                None => self.suspended = false,
            }
        }
    }

    /// Applies supervision requests that are already queued.
    fn drain_control(&mut self) {
        while let Ok(control) = self.control.try_recv() {
            self.on_control(control);
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Suspend => {
                debug!(id = %self.id, "Suspended");
                self.suspended = true;
            }
            Control::Resume => {
                debug!(id = %self.id, "Resumed");
                self.suspended = false;
            }
            Control::Describe(reply) => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            state: self.state,
            retries_left: self.retries_left,
            protocol: self.protocol,
            suspended: self.suspended,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

    use crate::connection::{Connection, Events};
    use crate::event::{Event, WsFrame};
    use crate::options::ConnectionType;
    use crate::protocol::spdy::Frame;
    use crate::supervisor::{ExitStatus, Supervisor};
    use crate::transport::mock::{MockConnector, Plan, read_head};

    fn options(retry: u32) -> Options {
        Options::new()
            .with_type(ConnectionType::Tcp)
            .with_retry(retry)
            .with_retry_timeout(Duration::from_millis(100))
            .with_keepalive(Duration::from_secs(3600))
    }

    fn open(
        connector: &Arc<MockConnector>,
        options: Options,
    ) -> (Connection, Events) {
        let connector: Arc<dyn Connector> = connector.clone();
        Supervisor::new()
            .open_with_connector("example.com", 80, options, connector)
            .unwrap()
    }

    fn mock(
        protocol: Protocol,
        plan: impl IntoIterator<Item = Plan>,
        fallback: Plan,
    ) -> (Arc<MockConnector>, UnboundedReceiver<DuplexStream>) {
        let (connector, servers) = MockConnector::new(protocol, plan, fallback);
        (Arc::new(connector), servers)
    }

    async fn read_spdy_frame(server: &mut DuplexStream) -> Frame {
        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        let length = (usize::from(header[5]) << 16) | (usize::from(header[6]) << 8) | usize::from(header[7]);
        let mut bytes = header.to_vec();
        bytes.resize(8 + length, 0);
        server.read_exact(&mut bytes[8..]).await.unwrap();
        Frame::decode(&bytes).unwrap().unwrap().0
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retries_fails_after_one_attempt() {
        let (connector, _servers) = mock(Protocol::Http, [], Plan::Refuse);
        let (conn, mut events) = open(&connector, options(0));

        let event = events.recv().await.unwrap();
        assert_eq!(event.error_reason(), Some(ErrorReason::RetriesExhausted));

        match conn.closed().await {
            ExitStatus::Failed(e) => assert!(matches!(
                *e,
                Error::RetriesExhausted { attempts: 1, .. }
            )),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert_eq!(connector.attempts(), 1);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_counts_attempts() {
        let (connector, _servers) = mock(Protocol::Http, [], Plan::Refuse);
        let (conn, _events) = open(&connector, options(2));

        let started = Instant::now();
        assert!(!conn.closed().await.is_normal());
        assert_eq!(connector.attempts(), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_restored_after_disconnect() {
        let (connector, mut servers) = mock(
            Protocol::Http,
            [Plan::Refuse, Plan::Refuse, Plan::Accept, Plan::Refuse, Plan::Refuse],
            Plan::Accept,
        );
        let (conn, _events) = open(&connector, options(2));

        let first = servers.recv().await.unwrap();
        let info = conn.describe().await.unwrap();
        assert_eq!(info.state, ConnectionState::Active);
        assert_eq!(info.protocol, Some(Protocol::Http));
        drop(first);

        let _second = servers.recv().await.unwrap();
        assert_eq!(connector.attempts(), 6);
        assert_eq!(conn.describe().await.unwrap().state, ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_queued_while_connecting_are_delivered() {
        let (connector, mut servers) = mock(Protocol::Http, [Plan::Refuse], Plan::Accept);
        let (conn, mut events) = open(&connector, options(1));

        let stream = conn.get("/queued", vec![]);

        let mut server = servers.recv().await.unwrap();
        let head = read_head(&mut server).await;
        assert!(head.starts_with("GET /queued HTTP/1.1\r\nhost: example.com\r\n"));

        server
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Response { stream: s, status: 200, is_fin: false, .. } if s == stream
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Data { stream, is_fin: true, data: Bytes::from_static(b"ok") }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_owner_rejected() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        let (intruder, mut intruder_events) = conn.detached();
        let _server = servers.recv().await.unwrap();

        let stream = intruder.get("/", vec![]);
        let event = intruder_events.recv().await.unwrap();
        assert_eq!(event.error_reason(), Some(ErrorReason::NotOwner));
        assert_eq!(event.stream(), Some(stream));

        intruder.shutdown();
        assert_eq!(conn.describe().await.unwrap().state, ConnectionState::Active);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_after_upgrade_is_bad_state() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        let _server = servers.recv().await.unwrap();

        conn.ws_upgrade("/ws", vec![]);
        let stream = conn.get("/", vec![]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.error_reason(), Some(ErrorReason::BadState));
        assert_eq!(event.stream(), Some(stream));
        assert_eq!(conn.describe().await.unwrap().state, ConnectionState::WsActive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_over_spdy_is_bad_state() {
        let (connector, mut servers) = mock(Protocol::Spdy, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        let _server = servers.recv().await.unwrap();

        conn.ws_upgrade("/ws", vec![]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.error_reason(), Some(ErrorReason::BadState));
        let info = conn.describe().await.unwrap();
        assert_eq!(info.state, ConnectionState::Active);
        assert_eq!(info.protocol, Some(Protocol::Spdy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ws_session_round_trip() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        let mut server = servers.recv().await.unwrap();

        conn.ws_upgrade("/chat", vec![]);
        conn.ws_send(WsFrame::text("hi"));

        let head = read_head(&mut server).await;
        let key = head
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {}\r\n\r\n",
            derive_accept_key(key.as_bytes())
        );
        server.write_all(response.as_bytes()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), Event::WsUpgraded { .. }));

        let mut frame = [0u8; 8];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x80 | 2);
        let mask = [frame[2], frame[3], frame[4], frame[5]];
        assert_eq!([frame[6] ^ mask[0], frame[7] ^ mask[1]], *b"hi");

        server.write_all(&[0x81, 0x03, b'y', b'o', b'u']).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::WsFrame(WsFrame::Text("you".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ws_send_before_upgrade_is_bad_state() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        conn.ws_send(WsFrame::text("too early"));
        let _server = servers.recv().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap().error_reason(),
            Some(ErrorReason::BadState)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_resume_after_reconnect() {
        let (connector, mut servers) = mock(Protocol::Spdy, [], Plan::Accept);
        let options = options(1).with_keepalive(Duration::from_millis(500));
        let (_conn, _events) = open(&connector, options);

        let mut server = servers.recv().await.unwrap();
        assert_eq!(read_spdy_frame(&mut server).await, Frame::Ping { id: 1 });
        assert_eq!(read_spdy_frame(&mut server).await, Frame::Ping { id: 3 });
        drop(server);

        let mut server = servers.recv().await.unwrap();
        assert_eq!(read_spdy_frame(&mut server).await, Frame::Ping { id: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_socket_fails_inflight_streams() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        let mut server = servers.recv().await.unwrap();

        let stream = conn.get("/slow", vec![]);
        read_head(&mut server).await;
        drop(server);

        let event = events.recv().await.unwrap();
        assert_eq!(event.stream(), Some(stream));
        assert_eq!(event.error_reason(), Some(ErrorReason::ConnectionLost));

        let _reconnected = servers.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_then_cancel_is_accepted() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, mut events) = open(&connector, options(0));
        let _server = servers.recv().await.unwrap();

        let stream = conn.get("/", vec![]);
        conn.cancel(stream);
        conn.shutdown();

        assert!(conn.closed().await.is_normal());
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_closes_socket() {
        let (connector, mut servers) = mock(Protocol::Spdy, [], Plan::Accept);
        let (conn, _events) = open(&connector, options(0));
        let mut server = servers.recv().await.unwrap();

        conn.shutdown();
        assert_eq!(
            read_spdy_frame(&mut server).await,
            Frame::GoAway { last_stream_id: 0, status: 0 }
        );
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(conn.closed().await.is_normal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_kills_actor() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, _events) = open(&connector, options(0));
        let _server = servers.recv().await.unwrap();

        conn.close();
        assert!(matches!(conn.closed().await, ExitStatus::Killed));
        assert!(conn.describe().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_actor_only_answers_describe() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, _events) = open(&connector, options(0));
        let mut server = servers.recv().await.unwrap();

        conn.suspend();
        conn.get("/later", vec![]);
        let info = conn.describe().await.unwrap();
        assert!(info.suspended);
        assert_eq!(info.host, "example.com");

        let mut byte = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_secs(1), server.read(&mut byte)).await;
        assert!(pending.is_err());

        conn.resume();
        let head = read_head(&mut server).await;
        assert!(head.starts_with("GET /later "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_holds_messages_until_resume() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, _events) = open(&connector, options(0));
        let mut server = servers.recv().await.unwrap();

        for _ in 0..16 {
            conn.suspend();
            conn.get("/held", vec![]);
            assert!(conn.describe().await.unwrap().suspended);

            let mut byte = [0u8; 1];
            let pending =
                tokio::time::timeout(Duration::from_millis(100), server.read(&mut byte)).await;
            assert!(pending.is_err());

            conn.resume();
            let head = read_head(&mut server).await;
            assert!(head.starts_with("GET /held "));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suspend_before_request_on_worker_threads() {
        let (connector, mut servers) = mock(Protocol::Http, [], Plan::Accept);
        let (conn, _events) = open(&connector, options(0));
        let mut server = servers.recv().await.unwrap();

        conn.suspend();
        conn.get("/held", vec![]);
        assert!(conn.describe().await.unwrap().suspended);

        let mut byte = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(200), server.read(&mut byte)).await;
        assert!(pending.is_err());

        conn.resume();
        let head = read_head(&mut server).await;
        assert!(head.starts_with("GET /held "));
    }

    fn bare_actor() -> (Actor, UnboundedReceiver<Event>) {
        let (notifier, events) = Notifier::channel();
        let (_mailbox_tx, mailbox) = mpsc::unbounded_channel();
        let (_control_tx, control) = mpsc::unbounded_channel();
        let actor = Actor::new(ActorConfig {
            id: ConnectionId::generate(),
            host: "example.com".into(),
            port: 80,
            authority: "example.com".into(),
            options: options(0),
            owner: CallerId::generate(),
            notifier,
            mailbox,
            control,
        });
        (actor, events)
    }

    #[test]
    fn test_failure_classification() {
        let (actor, mut events) = bare_actor();
        let stream = StreamRef::generate();

        let flow = actor.on_failure(Some(stream), Error::bad_state("not now"));
        assert!(matches!(flow, Flow::Continue));
        let event = events.try_recv().unwrap();
        assert_eq!(event.error_reason(), Some(ErrorReason::BadState));
        assert_eq!(event.stream(), Some(stream));

        let flow = actor.on_failure(Some(stream), Error::ConnectionClosed);
        assert!(matches!(flow, Flow::Disconnect(Error::ConnectionClosed)));
        assert!(events.try_recv().is_err());

        let flow = actor.on_failure(Some(stream), Error::internal("broken invariant"));
        assert!(matches!(flow, Flow::Disconnect(Error::Internal { .. })));
        assert_eq!(
            events.try_recv().unwrap().error_reason(),
            Some(ErrorReason::Internal)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_during_retry_wait() {
        let (connector, _servers) = mock(Protocol::Http, [Plan::Refuse], Plan::Refuse);
        let options = options(3).with_retry_timeout(Duration::from_secs(60));
        let (conn, _events) = open(&connector, options);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let info = conn.describe().await.unwrap();
        assert_eq!(info.state, ConnectionState::RetryWait);
        assert_eq!(info.retries_left, 2);
        assert_eq!(info.protocol, None);
    }

    #[tokio::test]
    async fn test_refused_tcp_without_retries_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (conn, mut events) = Supervisor::new()
            .open("127.0.0.1", port, options(0))
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap().error_reason(),
            Some(ErrorReason::RetriesExhausted)
        );
        assert!(matches!(conn.closed().await, ExitStatus::Failed(_)));
    }
}
