//! Server-side state for one accepted connection.
//!
//! A [`Session`] starts `Unauthenticated`. Until a login succeeds it only
//! accepts keepalives and auth/register requests; anything else closes it
//! with a protocol error. Its receive loop and heartbeat loop run
//! concurrently and share one [`watch`] shutdown signal.
//!
//! The heartbeat loop also enforces the idle limit: a session that has not
//! received any frame for `heartbeat_interval + heartbeat_timeout` is
//! closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::auth::AuthService;
use crate::error::{ConnectionError, DisconnectReason};
use crate::fragment::parse_fragment_payload;
use crate::framing::{Frame, FrameFlags, MessageType, read_frame};
use crate::messages::{AuthReply, AuthRequest, RegisterRequest};
use crate::reassembly::{Reassembler, ReassemblyBudget};
use crate::sink::{FramedSink, shutdown_requested};
use crate::tcp_server::{ConnectionId, ServerEvent};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no successful login yet.
    Unauthenticated,
    /// Logged in; application data is accepted.
    Authenticated,
    /// Torn down.
    Closed,
}

/// Timing knobs shared by every session of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between outgoing pings.
    pub heartbeat_interval: Duration,
    /// Grace on top of the interval before a silent peer is dropped.
    pub heartbeat_timeout: Duration,
    /// Idle time after which a half-received transfer is dropped.
    pub reassembly_timeout: Duration,
    /// Cap on concurrent inbound transfers and the bytes they hold.
    pub reassembly_budget: ReassemblyBudget,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            reassembly_timeout: Duration::from_secs(60),
            reassembly_budget: ReassemblyBudget::default(),
        }
    }
}

impl SessionConfig {
    /// Longest silence tolerated from the peer.
    pub fn idle_limit(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_timeout
    }
}

/// One client as seen by the server.
pub struct Session {
    id: ConnectionId,
    sink: FramedSink,
    config: SessionConfig,
    authenticated: AtomicBool,
    closed: AtomicBool,
    username: OnceLock<String>,
    created: Instant,
    /// Milliseconds after `created` at which the last frame arrived.
    last_receive_ms: AtomicU64,
    close_reason: OnceLock<DisconnectReason>,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    /// Create a session around the write half of an accepted stream.
    pub fn new(
        id: ConnectionId,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            sink: FramedSink::new(writer),
            config,
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            username: OnceLock::new(),
            created: Instant::now(),
            last_receive_ms: AtomicU64::new(0),
            close_reason: OnceLock::new(),
            shutdown_tx,
        })
    }

    /// Connection id this session is registered under.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.authenticated.load(Ordering::Acquire) {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// Whether a login has succeeded on this session.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Account name of the first successful login.
    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Time since the last inbound frame (or since accept, if none yet).
    pub fn idle_for(&self) -> Duration {
        self.last_receive().elapsed()
    }

    fn last_receive(&self) -> Instant {
        self.created + Duration::from_millis(self.last_receive_ms.load(Ordering::Acquire))
    }

    fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_receive_ms.store(ms, Ordering::Release);
    }

    /// Send a payload of any size, fragmenting it when it exceeds one frame.
    pub async fn send_data(
        &self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        self.sink.send_data(message_type, payload).await
    }

    /// Stream `total_length` bytes from `source` as a fragmented transfer.
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
        self.sink
            .send_large(message_type, source, total_length, chunk_size)
            .await
    }

    /// Close the session. The first reason given wins; later calls do nothing.
    pub async fn close(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_reason.set(reason);
        self.shutdown_tx.send_replace(true);
        self.sink.shutdown().await;
    }

    /// Drive the session until it closes and return why it ended.
    ///
    /// Spawns the heartbeat loop and runs the receive loop on the calling
    /// task. Application payloads are reported on `events`.
    pub async fn run<R>(
        self: Arc<Self>,
        mut reader: R,
        auth: Arc<dyn AuthService>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> DisconnectReason
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop(shutdown_rx.clone()));
        let mut reassembler = Reassembler::with_budget(self.config.reassembly_budget);

        let reason = loop {
            let result = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = shutdown_requested(&mut shutdown_rx) => break DisconnectReason::Requested,
            };

            let outcome = match result {
                Ok(frame) => {
                    self.touch();
                    // A reply can block on a peer that stopped reading.
                    tokio::select! {
                        outcome = self.handle_frame(frame, &mut reassembler, auth.as_ref(), &events) => outcome,
                        _ = shutdown_requested(&mut shutdown_rx) => break DisconnectReason::Requested,
                    }
                }
                Err(e) => Err(e.into()),
            };

            if let Err(e) = outcome {
                if e.is_protocol_violation() {
                    tracing::warn!("Session {} closed on protocol error: {e}", self.id);
                }
                break DisconnectReason::from_error(&e);
            }
        };

        self.close(reason).await;
        heartbeat.abort();
        let _ = heartbeat.await;

        self.close_reason
            .get()
            .cloned()
            .unwrap_or(DisconnectReason::Requested)
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        reassembler: &mut Reassembler,
        auth: &dyn AuthService,
        events: &mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<(), ConnectionError> {
        match frame.message_type {
            MessageType::Ping => {
                self.sink
                    .send(MessageType::Pong, &[], FrameFlags::NONE)
                    .await?;
            }
            MessageType::Pong => {}
            MessageType::AuthRequest => {
                let request = AuthRequest::decode(&frame.payload)?;
                let reply = self.login(request, auth).await;
                self.sink
                    .send(MessageType::AuthResponse, &reply.encode(), FrameFlags::NONE)
                    .await?;
            }
            MessageType::RegisterRequest => {
                let request = RegisterRequest::decode(&frame.payload)?;
                let reply = self.register(request, auth).await;
                self.sink
                    .send(
                        MessageType::RegisterResponse,
                        &reply.encode(),
                        FrameFlags::NONE,
                    )
                    .await?;
            }
            other if !self.is_authenticated() => {
                return Err(ConnectionError::Unauthenticated(other));
            }
            MessageType::AuthResponse | MessageType::RegisterResponse => {
                return Err(ConnectionError::UnexpectedMessage(frame.message_type));
            }
            MessageType::Data => {
                if !reassembler.is_empty() {
                    for transfer in reassembler.evict_stale(self.config.reassembly_timeout) {
                        tracing::warn!("Session {} dropped stalled transfer {transfer}", self.id);
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

                let _ = events.send(ServerEvent::DataReceived {
                    id: self.id,
                    message_type: frame.message_type,
                    payload,
                });
            }
        }
        Ok(())
    }

    async fn login(&self, request: AuthRequest, auth: &dyn AuthService) -> AuthReply {
        match auth.login(&request.username, &request.password).await {
            Ok(outcome) => {
                if outcome.accepted {
                    let _ = self.username.set(request.username.clone());
                    self.authenticated.store(true, Ordering::Release);
                    tracing::info!("Session {} authenticated as '{}'", self.id, request.username);
                } else {
                    tracing::info!(
                        "Session {} login rejected for '{}': {}",
                        self.id,
                        request.username,
                        outcome.message
                    );
                }
                AuthReply {
                    success: outcome.accepted,
                    message: outcome.message,
                }
            }
            Err(e) => {
                tracing::warn!("Session {} auth service error: {e}", self.id);
                AuthReply {
                    success: false,
                    message: "Authentication service unavailable.".to_string(),
                }
            }
        }
    }

    async fn register(&self, request: RegisterRequest, auth: &dyn AuthService) -> AuthReply {
        tracing::debug!(
            "Session {} register '{}' email='{}' info='{}'",
            self.id,
            request.username,
            request.email,
            request.info
        );
        match auth.register(&request.username, &request.password).await {
            Ok(outcome) => AuthReply {
                success: outcome.accepted,
                message: outcome.message,
            },
            Err(e) => {
                tracing::warn!("Session {} auth service error: {e}", self.id);
                AuthReply {
                    success: false,
                    message: "Registration service unavailable.".to_string(),
                }
            }
        }
    }

    /// Ping every interval and close the session once the peer has been
    /// silent past the idle limit.
    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // The ping itself can stall on a full socket; the idle
                    // limit and shutdown still apply while it is pending.
                    tokio::select! {
                        result = self.sink.send(MessageType::Ping, &[], FrameFlags::NONE) => {
                            if let Err(e) = result {
                                tracing::debug!("Session {} heartbeat ping failed: {e}", self.id);
                            }
                            continue;
                        }
                        _ = self.idle_expired() => {}
                        _ = shutdown_requested(&mut shutdown_rx) => break,
                    }
                }
                _ = self.idle_expired() => {}
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }

            tracing::warn!("Session {} heartbeat timeout after {:?}", self.id, self.idle_for());
            self.close(DisconnectReason::HeartbeatTimeout).await;
            break;
        }
    }

    /// Resolves once nothing has been received for the idle limit.
    async fn idle_expired(&self) {
        let limit = self.config.idle_limit();
        loop {
            tokio::time::sleep_until(self.last_receive() + limit).await;
            if self.idle_for() >= limit {
                return;
            }
        }
    }
}
