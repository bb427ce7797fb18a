//! Game server: accepts connections, runs a [`Session`] per client, and
//! offers unicast and broadcast sends.
//!
//! Sessions are indexed in a [`ConnectionMap`] that the accept path,
//! terminating sessions and senders touch concurrently without any caller
//! locking.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::auth::AuthService;
use crate::error::{ConnectionError, DisconnectReason};
use crate::framing::MessageType;
use crate::session::{Session, SessionConfig, SessionState};
use crate::sink::shutdown_requested;
use crate::transport::{BoxedStream, ServerTls, TlsError, build_acceptor};

/// Unique identifier for a connection within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when the connection map is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit of {0} reached")]
pub struct ConnectionLimitReached(pub usize);

/// Concurrent map of live sessions keyed by [`ConnectionId`].
pub struct ConnectionMap {
    inner: DashMap<ConnectionId, Arc<Session>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: DashMap::new(),
            max_connections,
        }
    }

    /// Whether another session would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.max_connections
    }

    /// Insert a session. Returns `Err` if the map is at capacity.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), ConnectionLimitReached> {
        if self.is_full() {
            return Err(ConnectionLimitReached(self.max_connections));
        }
        self.inner.insert(session.id(), session);
        Ok(())
    }

    /// Remove a session by ID.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.inner.remove(id).map(|(_, session)| session)
    }

    /// Look a session up. The map guard is released before returning.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Point-in-time copy of every session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Ids of every session, in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.inner.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Return the number of active connections.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Return whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Configuration for [`GameServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind to. Default: `0.0.0.0:9000`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// TLS mode. Default: plain TCP.
    pub tls: ServerTls,
    /// Limit on the TLS handshake of a freshly accepted socket. Default: 10 s.
    pub handshake_timeout: Duration,
    /// Heartbeat and reassembly timing for every session.
    pub session: SessionConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_connections: 256,
            tls: ServerTls::Disabled,
            handshake_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Something that happened on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client was accepted and registered.
    ClientConnected(ConnectionId),
    /// A client's session ended and was unregistered.
    ClientDisconnected {
        /// Which client.
        id: ConnectionId,
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// An authenticated client sent an application payload.
    DataReceived {
        /// Which client.
        id: ConnectionId,
        /// Frame type it arrived with.
        message_type: MessageType,
        /// Payload bytes, reassembled if it arrived in fragments.
        payload: Vec<u8>,
    },
}

/// Errors starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// TLS material could not be loaded.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// Binding the listener failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// `start` was called on a running server.
    #[error("server already started")]
    AlreadyStarted,
}

/// State shared between the server handle and its background tasks.
struct Shared {
    sessions: ConnectionMap,
    id_gen: IdGenerator,
    auth: Arc<dyn AuthService>,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    session_config: SessionConfig,
    events: mpsc::UnboundedSender<ServerEvent>,
}

struct Running {
    local_addr: SocketAddr,
    /// Sending `true` stops the accept loop.
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// TCP game server that accepts connections and manages their lifecycle.
pub struct GameServer {
    options: ServerOptions,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl GameServer {
    /// Create a stopped server and the receiver for its events.
    ///
    /// Fails only if TLS is enabled and the certificate or key cannot be loaded.
    pub fn new(
        options: ServerOptions,
        auth: Arc<dyn AuthService>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ServerError> {
        let acceptor = build_acceptor(&options.tls)?;
        if acceptor.is_none() {
            tracing::warn!("TLS disabled, client traffic is not encrypted");
        }

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            sessions: ConnectionMap::new(options.max_connections),
            id_gen: IdGenerator::new(),
            auth,
            acceptor,
            handshake_timeout: options.handshake_timeout,
            session_config: options.session,
            events,
        });

        Ok((
            Self {
                options,
                shared,
                running: Mutex::new(None),
            },
            rx,
        ))
    }

    /// Bind to the configured address and start accepting.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.options.bind_addr).await?;
        self.start_with_listener(listener).await
    }

    /// Start accepting on a pre-bound listener (useful for tests).
    pub async fn start_with_listener(
        &self,
        listener: TcpListener,
    ) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            shutdown_rx,
        ));

        tracing::info!("Server listening on {local_addr}");
        *running = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every session and clear the registry.
    /// Does nothing if the server is not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        tracing::info!("Server shutting down");
        let _ = running.shutdown_tx.send(true);
        let _ = running.accept_task.await;

        for session in self.shared.sessions.snapshot() {
            session.close(DisconnectReason::Shutdown).await;
        }
        self.shared.sessions.clear();
    }

    /// Send to one client. Unknown ids are ignored.
    pub async fn send(
        &self,
        id: ConnectionId,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        match self.shared.sessions.get(&id) {
            Some(session) => session.send_data(message_type, payload).await,
            None => Ok(()),
        }
    }

    /// Send to every registered client. A failure on one client is logged
    /// and does not stop delivery to the rest. Returns how many sends succeeded.
    pub async fn broadcast(&self, message_type: MessageType, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.shared.sessions.snapshot() {
            match session.send_data(message_type, payload).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Broadcast to {} failed: {e}", session.id()),
            }
        }
        delivered
    }

    /// Close one client's session.
    pub async fn kick(&self, id: ConnectionId) {
        if let Some(session) = self.shared.sessions.get(&id) {
            session.close(DisconnectReason::Requested).await;
        }
    }

    /// Address the server is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Number of registered sessions.
    pub fn connection_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Ids of every registered session.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.sessions.ids()
    }

    /// State of one session, if registered.
    pub fn session_state(&self, id: ConnectionId) -> Option<SessionState> {
        self.shared.sessions.get(&id).map(|s| s.state())
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(handle_connection(
                        Arc::clone(&shared),
                        stream,
                        peer_addr,
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown_requested(&mut shutdown_rx) => break,
        }
    }
}

/// Per-connection task: handshake, register, run the session, unregister.
async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) {
    if shared.sessions.is_full() {
        tracing::warn!("Connection limit reached, rejecting {peer_addr}");
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {peer_addr}: {e}");
    }

    let stream: BoxedStream = match &shared.acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(shared.handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => Box::new(tls),
                Ok(Err(e)) => {
                    tracing::warn!("TLS handshake with {peer_addr} failed: {e}");
                    return;
                }
                Err(_) => {
                    tracing::warn!("TLS handshake with {peer_addr} timed out");
                    return;
                }
            }
        }
        None => Box::new(stream),
    };

    let (reader, writer) = tokio::io::split(stream);
    let id = shared.id_gen.next_id();
    let session = Session::new(id, Box::new(writer), shared.session_config);

    if let Err(e) = shared.sessions.insert(Arc::clone(&session)) {
        tracing::warn!("{e}, rejecting {peer_addr}");
        session.close(DisconnectReason::Shutdown).await;
        return;
    }
    if *shutdown_rx.borrow() {
        shared.sessions.remove(&id);
        session.close(DisconnectReason::Shutdown).await;
        return;
    }

    tracing::info!("Accepted connection {id} from {peer_addr}");
    let _ = shared.events.send(ServerEvent::ClientConnected(id));

    let reason = Arc::clone(&session)
        .run(reader, Arc::clone(&shared.auth), shared.events.clone())
        .await;

    shared.sessions.remove(&id);
    tracing::info!("Connection {id} closed: {reason}");
    let _ = shared
        .events
        .send(ServerEvent::ClientDisconnected { id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuthService;
    use crate::framing::{FrameError, FrameFlags, read_frame, write_frame};
    use crate::messages::{AuthReply, AuthRequest};
    use tokio::net::TcpStream;

    /// Helper: start a server on an ephemeral port and return the bound address.
    async fn start_test_server(
        max_connections: usize,
    ) -> (SocketAddr, GameServer, mpsc::UnboundedReceiver<ServerEvent>) {
        let options = ServerOptions {
            max_connections,
            ..ServerOptions::default()
        };
        let auth = Arc::new(MemoryAuthService::new().with_user("alice", "correct"));
        let (server, events) = GameServer::new(options, auth).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.start_with_listener(listener).await.unwrap();
        (addr, server, events)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn logged_in_client(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = AuthRequest {
            username: "alice".to_string(),
            password: "correct".to_string(),
        };
        write_frame(
            &mut stream,
            MessageType::AuthRequest,
            &request.encode(),
            1,
            FrameFlags::NONE,
        )
        .await
        .unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        assert!(AuthReply::decode(&reply.payload).unwrap().success);
        stream
    }

    #[tokio::test]
    async fn test_accept_registers_and_emits_connected() {
        let (addr, server, mut events) = start_test_server(16).await;
        let _stream = TcpStream::connect(addr).await.unwrap();

        let ServerEvent::ClientConnected(id) = next_event(&mut events).await else {
            panic!("expected ClientConnected");
        };
        assert_eq!(server.connection_ids(), vec![id]);
        assert_eq!(server.session_state(id), Some(SessionState::Unauthenticated));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (addr, server, mut events) = start_test_server(16).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let ServerEvent::ClientConnected(id) = next_event(&mut events).await else {
            panic!("expected ClientConnected");
        };

        drop(stream);
        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::ClientDisconnected {
                id,
                reason: DisconnectReason::PeerClosed
            }
        );
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let (addr, server, mut events) = start_test_server(2).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;
        assert_eq!(server.connection_count(), 2);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            read_frame(&mut c3).await,
            Err(FrameError::ConnectionClosed) | Err(FrameError::Io(_))
        ));
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_send_to_unknown_id_is_noop() {
        let (_addr, server, _events) = start_test_server(4).await;
        server
            .send(ConnectionId(999), MessageType::Data, b"nobody")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_target() {
        let (addr, server, mut events) = start_test_server(4).await;
        let mut a = logged_in_client(addr).await;
        let ServerEvent::ClientConnected(a_id) = next_event(&mut events).await else {
            panic!("expected ClientConnected");
        };
        let mut b = logged_in_client(addr).await;
        next_event(&mut events).await;

        server.send(a_id, MessageType::Data, b"for a").await.unwrap();
        assert_eq!(read_frame(&mut a).await.unwrap().payload, b"for a");

        let nothing =
            tokio::time::timeout(Duration::from_millis(100), read_frame(&mut b)).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_stop_closes_sessions() {
        let (addr, server, mut events) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let ServerEvent::ClientConnected(id) = next_event(&mut events).await else {
            panic!("expected ClientConnected");
        };

        server.stop().await;
        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().await.is_none());
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(FrameError::ConnectionClosed)
        ));
        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::ClientDisconnected {
                id,
                reason: DisconnectReason::Shutdown
            }
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (_addr, server, _events) = start_test_server(4).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.start_with_listener(listener).await,
            Err(ServerError::AlreadyStarted)
        ));
        server.stop().await;
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        let id3 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.0 + 1, id2.0);
        assert_eq!(id2.0 + 1, id3.0);
        assert_eq!(id3.to_string(), "#3");
    }

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.bind_addr.port(), 9000);
        assert_eq!(options.max_connections, 256);
        assert_eq!(options.session.idle_limit(), Duration::from_secs(45));
    }
}
