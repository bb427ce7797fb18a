//! Client-side automatic reconnection.
//!
//! [`ReconnectingClient`] wraps a [`GameClient`] and watches its events.
//! An unexpected disconnect or a failed connect schedules a retry as a
//! cancellable task on the runtime; [`ReconnectState`] decides the delay and
//! when to give up. A successful connect resets the retry budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ConnectionError;
use crate::sink::shutdown_requested;
use crate::tcp_client::{ClientEvent, ClientOptions, ConnectionState, GameClient};

/// Configuration for client-side reconnection behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Whether retries are scheduled at all. Default: true.
    pub enabled: bool,
    /// Delay before reconnecting after a live link dropped. Default: 5 s.
    pub disconnect_delay: Duration,
    /// Delay before retrying after a connect attempt failed. Default: 10 s.
    pub connect_fail_delay: Duration,
    /// Retries allowed before giving up. Default: 10.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disconnect_delay: Duration::from_secs(5),
            connect_fail_delay: Duration::from_secs(10),
            max_retries: 10,
        }
    }
}

/// What triggered a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    /// An established link went down.
    Disconnected,
    /// A connect attempt failed.
    ConnectFailed,
}

/// Tracks the retry count and picks the delay for the next attempt.
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    retries: u32,
}

impl ReconnectState {
    /// Create a new state from the given config.
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Count one more retry and return its delay, or `None` once the
    /// counter has passed `max_retries`.
    pub fn next_delay(&mut self, cause: RetryCause) -> Option<Duration> {
        self.retries = self.retries.saturating_add(1);
        if self.retries > self.config.max_retries {
            return None;
        }
        Some(match cause {
            RetryCause::Disconnected => self.config.disconnect_delay,
            RetryCause::ConnectFailed => self.config.connect_fail_delay,
        })
    }

    /// Reset the counter (called after a successful connect).
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Return the number of retries counted so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Errors produced by the reconnection system.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// The initial connect failed. A retry may already be scheduled.
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectionError),
}

enum Plan {
    Retry(Duration),
    GiveUp,
    Idle,
}

struct PolicyShared {
    config: ReconnectConfig,
    stopped: AtomicBool,
    state: Mutex<ReconnectState>,
    pending: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl PolicyShared {
    async fn plan(&self, cause: RetryCause) -> Plan {
        if !self.config.enabled || self.stopped.load(Ordering::Acquire) {
            return Plan::Idle;
        }
        match self.state.lock().await.next_delay(cause) {
            Some(delay) => Plan::Retry(delay),
            None => Plan::GiveUp,
        }
    }

    async fn schedule(self: &Arc<Self>, client: &GameClient, delay: Duration) {
        let client = client.clone();
        let shared = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !shared.stopped.load(Ordering::Acquire) {
                        let attempt = shared.state.lock().await.retries();
                        tracing::info!("Reconnect attempt {attempt}");
                        // Failures come back through the event channel.
                        let _ = client.connect().await;
                    }
                }
                _ = shutdown_requested(&mut stop_rx) => {}
            }
        });

        if let Some(previous) = self.pending.lock().await.replace(task) {
            previous.abort();
        }
    }

    async fn cancel_pending(&self) {
        let task = self.pending.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

/// A [`GameClient`] that reconnects by itself.
pub struct ReconnectingClient {
    client: GameClient,
    shared: Arc<PolicyShared>,
    driver: JoinHandle<()>,
}

impl ReconnectingClient {
    /// Create the wrapper and the receiver for the events it forwards.
    ///
    /// `ConnectFail` events carry `retrying: true` whenever a retry has been
    /// scheduled. When the budget runs out a final `ConnectFail` with
    /// `retrying: false` is emitted.
    pub fn new(
        options: ClientOptions,
        config: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let client = GameClient::with_events(options, internal_tx);
        let (stop_tx, _) = watch::channel(false);

        let shared = Arc::new(PolicyShared {
            state: Mutex::new(ReconnectState::new(config.clone())),
            config,
            stopped: AtomicBool::new(false),
            pending: Mutex::new(None),
            stop_tx,
        });

        let driver = tokio::spawn(drive(
            client.clone(),
            Arc::clone(&shared),
            internal_rx,
            app_tx,
        ));

        (
            Self {
                client,
                shared,
                driver,
            },
            app_rx,
        )
    }

    /// Enable reconnection and connect.
    ///
    /// An error means the first attempt failed; if reconnection is enabled a
    /// retry is already scheduled.
    pub async fn start(&self) -> Result<(), ReconnectError> {
        self.shared.stopped.store(false, Ordering::Release);
        self.shared.stop_tx.send_replace(false);
        self.shared.state.lock().await.reset();
        self.client.connect().await?;
        Ok(())
    }

    /// Disable reconnection and tear the connection down, returning once
    /// the client reports [`ConnectionState::Disconnected`].
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop_tx.send_replace(true);
        self.shared.cancel_pending().await;

        self.client.disconnect().await;
        let mut state = self.client.state().subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// The wrapped client, for login, register and sends.
    pub fn client(&self) -> &GameClient {
        &self.client
    }

    /// Retries counted since the last successful connect.
    pub async fn retries(&self) -> u32 {
        self.shared.state.lock().await.retries()
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop_tx.send_replace(true);
        self.driver.abort();
    }
}

/// Forward client events to the application, scheduling retries on the way.
async fn drive(
    client: GameClient,
    shared: Arc<PolicyShared>,
    mut internal: mpsc::UnboundedReceiver<ClientEvent>,
    app: mpsc::UnboundedSender<ClientEvent>,
) {
    let max_retries = shared.config.max_retries;

    while let Some(event) = internal.recv().await {
        match event {
            ClientEvent::Connected => {
                shared.state.lock().await.reset();
                let _ = app.send(ClientEvent::Connected);
            }
            ClientEvent::ConnectFail { reason, .. } => {
                let event = match shared.plan(RetryCause::ConnectFailed).await {
                    Plan::Retry(delay) => {
                        tracing::info!("Connect failed, retrying in {delay:?}");
                        shared.schedule(&client, delay).await;
                        ClientEvent::ConnectFail {
                            reason,
                            retrying: true,
                        }
                    }
                    Plan::GiveUp => {
                        tracing::warn!("Giving up after {max_retries} reconnect attempts");
                        ClientEvent::ConnectFail {
                            reason: format!("{reason} (gave up after {max_retries} retries)"),
                            retrying: false,
                        }
                    }
                    Plan::Idle => ClientEvent::ConnectFail {
                        reason,
                        retrying: false,
                    },
                };
                let _ = app.send(event);
            }
            ClientEvent::Disconnected { reason } => {
                let unexpected = !reason.is_local();
                let _ = app.send(ClientEvent::Disconnected { reason });
                if !unexpected {
                    continue;
                }

                match shared.plan(RetryCause::Disconnected).await {
                    Plan::Retry(delay) => {
                        tracing::info!("Connection lost, reconnecting in {delay:?}");
                        shared.schedule(&client, delay).await;
                    }
                    Plan::GiveUp => {
                        tracing::warn!("Giving up after {max_retries} reconnect attempts");
                        let _ = app.send(ClientEvent::ConnectFail {
                            reason: format!("reconnect limit of {max_retries} retries reached"),
                            retrying: false,
                        });
                    }
                    Plan::Idle => {}
                }
            }
            other => {
                let _ = app.send(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DisconnectReason;
    use tokio::net::TcpListener;

    fn fast_config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            disconnect_delay: Duration::from_millis(20),
            connect_fail_delay: Duration::from_millis(20),
            max_retries,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_delay_depends_on_cause() {
        let mut state = ReconnectState::new(ReconnectConfig::default());
        assert_eq!(
            state.next_delay(RetryCause::Disconnected),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            state.next_delay(RetryCause::ConnectFailed),
            Some(Duration::from_secs(10))
        );
        assert_eq!(state.retries(), 2);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut state = ReconnectState::new(ReconnectConfig::default());
        for _ in 0..10 {
            assert!(state.next_delay(RetryCause::ConnectFailed).is_some());
        }
        assert_eq!(state.next_delay(RetryCause::ConnectFailed), None);
        assert_eq!(state.next_delay(RetryCause::Disconnected), None);

        state.reset();
        assert_eq!(state.retries(), 0);
        assert!(state.next_delay(RetryCause::Disconnected).is_some());
    }

    #[tokio::test]
    async fn test_connect_failures_retry_then_give_up() {
        let options = ClientOptions {
            port: closed_port().await,
            ..ClientOptions::default()
        };
        let (client, mut events) = ReconnectingClient::new(options, fast_config(2));

        assert!(client.start().await.is_err());

        let mut retrying = Vec::new();
        for _ in 0..3 {
            match next_event(&mut events).await {
                ClientEvent::ConnectFail { retrying: r, .. } => retrying.push(r),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(retrying, [true, true, false]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_policy_does_not_retry() {
        let options = ClientOptions {
            port: closed_port().await,
            ..ClientOptions::default()
        };
        let config = ReconnectConfig {
            enabled: false,
            ..fast_config(5)
        };
        let (client, mut events) = ReconnectingClient::new(options, config);

        assert!(client.start().await.is_err());
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::ConnectFail { retrying: false, .. }
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = ClientOptions {
            port: listener.local_addr().unwrap().port(),
            ..ClientOptions::default()
        };
        let (client, mut events) = ReconnectingClient::new(options, fast_config(3));

        client.start().await.unwrap();
        let (first, _) = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

        drop(first);
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Disconnected {
                reason: DisconnectReason::PeerClosed
            }
        );

        let (_second, _) = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
        assert_eq!(client.retries().await, 0);
        assert!(client.client().is_connected());

        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_prevents_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = ClientOptions {
            port: listener.local_addr().unwrap().port(),
            ..ClientOptions::default()
        };
        let (client, mut events) = ReconnectingClient::new(options, fast_config(3));

        client.start().await.unwrap();
        let _server = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

        client.stop().await;
        assert_eq!(client.client().state().current(), ConnectionState::Disconnected);
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Disconnected {
                reason: DisconnectReason::Requested
            }
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert!(!client.client().is_connected());
    }
}
