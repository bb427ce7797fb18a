//! Client side of a game server connection.
//!
//! [`GameClient`] owns at most one live link at a time. Each link runs a
//! receive loop and a heartbeat loop as separate tasks that share a
//! [`watch`] shutdown signal. State changes are broadcast via a
//! [`ConnectionStateWatch`] so any number of consumers can react without
//! polling; everything else the application needs to know arrives as
//! [`ClientEvent`]s on an unbounded channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ConnectionError, DisconnectReason};
use crate::fragment::parse_fragment_payload;
use crate::framing::{Frame, FrameFlags, MessageType, read_frame};
use crate::messages::{AuthReply, AuthRequest, RegisterRequest};
use crate::reassembly::{Reassembler, ReassemblyBudget};
use crate::sink::{FramedSink, shutdown_requested};
use crate::transport::{BoxedStream, ClientTls, TlsClientSetup};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a connection.
    Connecting,
    /// Connection established, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A link is up.
    Connected,
    /// The link went down.
    Disconnected {
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// A connect attempt failed.
    ConnectFail {
        /// What went wrong.
        reason: String,
        /// Whether another attempt has been scheduled.
        retrying: bool,
    },
    /// The server accepted our credentials.
    AuthComplete {
        /// Server message.
        message: String,
    },
    /// The server rejected our credentials.
    AuthFail {
        /// Server message.
        message: String,
    },
    /// The server created our account.
    RegistrationComplete {
        /// Server message.
        message: String,
    },
    /// The server refused to create our account.
    RegistrationFail {
        /// Server message.
        message: String,
    },
    /// Any frame not consumed by the client itself (everything but `Ping`
    /// and the auth/register replies), reassembled if it arrived in fragments.
    DataReceived {
        /// Frame type it arrived with.
        message_type: MessageType,
        /// Payload bytes.
        payload: Vec<u8>,
    },
}

/// Settings for [`GameClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS mode.
    pub tls: ClientTls,
    /// Time between outgoing pings.
    pub heartbeat_interval: Duration,
    /// Upper bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Idle time after which a half-received transfer is dropped.
    pub reassembly_timeout: Duration,
    /// Cap on concurrent inbound transfers and the bytes they hold.
    pub reassembly_budget: ReassemblyBudget,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            tls: ClientTls::Disabled,
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reassembly_timeout: Duration::from_secs(60),
            reassembly_budget: ReassemblyBudget::default(),
        }
    }
}

/// One live connection.
struct Link {
    id: u64,
    sink: Arc<FramedSink>,
    /// Sending `true` causes reader and heartbeat tasks to exit.
    shutdown_tx: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
}

struct Inner {
    options: ClientOptions,
    state: ConnectionStateWatch,
    authenticated: AtomicBool,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Handle to a game server connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct GameClient {
    inner: Arc<Inner>,
}

impl GameClient {
    /// Create a disconnected client and the receiver for its events.
    pub fn new(options: ClientOptions) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_events(options, tx), rx)
    }

    /// Create a disconnected client that reports to an existing channel.
    pub fn with_events(options: ClientOptions, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: ConnectionStateWatch::new(),
                authenticated: AtomicBool::new(false),
                link: Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Connect to the configured server.
    ///
    /// Sets `TCP_NODELAY`, runs the TLS handshake if configured, then
    /// spawns reader + heartbeat background tasks. On failure a
    /// [`ClientEvent::ConnectFail`] is emitted and the client stays
    /// disconnected.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let mut slot = inner.link.lock().await;
        if slot.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        inner.state.set(ConnectionState::Connecting);
        let addr = format!("{}:{}", inner.options.host, inner.options.port);

        let stream = match inner.open().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Connection to {addr} failed: {e}");
                inner.state.set(ConnectionState::Disconnected);
                inner.emit(ClientEvent::ConnectFail {
                    reason: e.to_string(),
                    retrying: false,
                });
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let sink = Arc::new(FramedSink::new(Box::new(writer)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = inner.next_link_id.fetch_add(1, Ordering::Relaxed);

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&sink),
            inner.options.heartbeat_interval,
            shutdown_rx.clone(),
        ));
        *slot = Some(Link {
            id,
            sink: Arc::clone(&sink),
            shutdown_tx,
            heartbeat,
        });
        inner.authenticated.store(false, Ordering::Release);
        inner.state.set(ConnectionState::Connected);
        inner.emit(ClientEvent::Connected);
        tracing::info!("Connected to {addr}");

        tokio::spawn(receive_loop(
            Arc::clone(inner),
            id,
            reader,
            sink,
            shutdown_rx,
        ));

        Ok(())
    }

    /// Disconnect from the server.
    ///
    /// Signals background tasks to exit, closes the stream and emits
    /// [`ClientEvent::Disconnected`]. Calling it again, or while never
    /// connected, has no further effect.
    pub async fn disconnect(&self) {
        let link = self.inner.link.lock().await.take();
        match link {
            Some(link) => self.inner.close_link(link, DisconnectReason::Requested).await,
            None => self.inner.state.set(ConnectionState::Disconnected),
        }
    }

    /// Send credentials. The verdict arrives as `AuthComplete` or `AuthFail`.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ConnectionError> {
        let payload = AuthRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
        .encode();
        self.inner
            .sink()
            .await?
            .send(MessageType::AuthRequest, &payload, FrameFlags::NONE)
            .await?;
        Ok(())
    }

    /// Ask the server to create an account. Empty `email`/`info` are sent as empty strings.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
        info: &str,
    ) -> Result<(), ConnectionError> {
        let payload = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
            info: info.to_string(),
        }
        .encode();
        self.inner
            .sink()
            .await?
            .send(MessageType::RegisterRequest, &payload, FrameFlags::NONE)
            .await?;
        Ok(())
    }

    /// Send a payload of any size, fragmenting it when it exceeds one frame.
    pub async fn send_data(
        &self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        self.inner.sink().await?.send_data(message_type, payload).await
    }

    /// Stream `total_length` bytes from `source` as a fragmented transfer.
    /// See [`FramedSink::send_large`].
    pub async fn send_large<R>(
        &self,
        message_type: MessageType,
        source: R,
        total_length: u64,
        chunk_size: usize,
    ) -> Result<u64, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        self.inner
            .sink()
            .await?
            .send_large(message_type, source, total_length, chunk_size)
            .await
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.inner.state
    }

    /// Whether a link is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.state.current() == ConnectionState::Connected
    }

    /// Whether the server accepted a login on the current link.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// The options this client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn open(&self) -> Result<BoxedStream, ConnectionError> {
        let tls = TlsClientSetup::from_mode(&self.options.tls)?;
        if tls.is_none() {
            tracing::warn!("TLS disabled, connection is not encrypted");
        }

        let establish = async {
            let tcp = TcpStream::connect((self.options.host.as_str(), self.options.port)).await?;
            tcp.set_nodelay(true)?;
            let stream: BoxedStream = match &tls {
                Some(setup) => setup.wrap(tcp).await?,
                None => Box::new(tcp),
            };
            Ok::<_, ConnectionError>(stream)
        };

        tokio::time::timeout(self.options.connect_timeout, establish)
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    async fn sink(&self) -> Result<Arc<FramedSink>, ConnectionError> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| Arc::clone(&link.sink))
            .ok_or(ConnectionError::NotConnected)
    }

    async fn close_link(&self, link: Link, reason: DisconnectReason) {
        let _ = link.shutdown_tx.send(true);
        link.heartbeat.abort();
        link.sink.shutdown().await;
        self.authenticated.store(false, Ordering::Release);
        self.state.set(ConnectionState::Disconnected);
        tracing::info!("Disconnected: {reason}");
        self.emit(ClientEvent::Disconnected { reason });
    }

    /// Tear down link `id` from inside its own receive loop. A no-op if
    /// `disconnect` or a newer `connect` got there first.
    async fn close_from_loop(&self, id: u64, reason: DisconnectReason) {
        let link = {
            let mut slot = self.link.lock().await;
            match slot.as_ref() {
                Some(link) if link.id == id => slot.take(),
                _ => None,
            }
        };
        if let Some(link) = link {
            self.close_link(link, reason).await;
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        sink: &FramedSink,
        reassembler: &mut Reassembler,
    ) -> Result<(), ConnectionError> {
        match frame.message_type {
            MessageType::Ping => {
                sink.send(MessageType::Pong, &[], FrameFlags::NONE).await?;
            }
            MessageType::AuthResponse => {
                let reply = AuthReply::decode(&frame.payload)?;
                if reply.success {
                    self.authenticated.store(true, Ordering::Release);
                }
                self.emit(if reply.success {
                    ClientEvent::AuthComplete {
                        message: reply.message,
                    }
                } else {
                    ClientEvent::AuthFail {
                        message: reply.message,
                    }
                });
            }
            MessageType::RegisterResponse => {
                let reply = AuthReply::decode(&frame.payload)?;
                self.emit(if reply.success {
                    ClientEvent::RegistrationComplete {
                        message: reply.message,
                    }
                } else {
                    ClientEvent::RegistrationFail {
                        message: reply.message,
                    }
                });
            }
            message_type => {
                if !reassembler.is_empty() {
                    for id in reassembler.evict_stale(self.options.reassembly_timeout) {
                        tracing::warn!("Dropped stalled transfer {id}");
                    }
                }

                let payload = if frame.flags.is_fragment() {
                    let fragment = parse_fragment_payload(&frame.payload)?;
                    match reassembler.add_fragment(&fragment)? {
                        Some(payload) => payload,
                        None => return Ok(()),
                    }
                } else {
                    frame.payload
                };

                self.emit(ClientEvent::DataReceived {
                    message_type,
                    payload,
                });
            }
        }
        Ok(())
    }
}

/// Read frames until the stream fails, the peer misbehaves or shutdown is signalled.
async fn receive_loop(
    inner: Arc<Inner>,
    link_id: u64,
    mut reader: ReadHalf<BoxedStream>,
    sink: Arc<FramedSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reassembler = Reassembler::with_budget(inner.options.reassembly_budget);

    let reason = loop {
        let result = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = shutdown_requested(&mut shutdown_rx) => return,
        };

        let outcome = match result {
            Ok(frame) => tokio::select! {
                outcome = inner.handle_frame(frame, &sink, &mut reassembler) => outcome,
                _ = shutdown_requested(&mut shutdown_rx) => return,
            },
            Err(e) => Err(e.into()),
        };

        if let Err(e) = outcome {
            if e.is_protocol_violation() {
                tracing::warn!("Protocol error from server: {e}");
            }
            break DisconnectReason::from_error(&e);
        }
    };

    inner.close_from_loop(link_id, reason).await;
}

/// Send a ping every `interval`. Send failures are left for the receive loop to notice.
async fn heartbeat_loop(
    sink: Arc<FramedSink>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tokio::select! {
                    result = sink.send(MessageType::Ping, &[], FrameFlags::NONE) => {
                        if let Err(e) = result {
                            tracing::debug!("Heartbeat ping failed: {e}");
                        }
                    }
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                }
            }
            _ = shutdown_requested(&mut shutdown_rx) => break,
        }
    }
}
