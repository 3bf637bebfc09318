//! Session-mode transport.
//!
//! [`SessionTransport`] connects to a queue server's `/ws` endpoint with
//! tokio-tungstenite and implements [`Transport`] for the sync agent. A
//! background task owns the socket: it reconnects with exponential backoff,
//! sends heartbeats and tracks round-trip latency.
//!
//! ```text
//! SyncAgent ──send_data──▶ outbound mpsc ──▶ driver task ──▶ WebSocket
//!     ▲                                            │
//!     └──────── HandlerSet::notify ◀───────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use queue_core::{
    current_timestamp, ClientMessage, DataHandler, HandlerSet, QueueError, QueueResult,
    RetryConfig, ServerMessage, Subscription, Transport, TransportEvent, TransportMode,
};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const HEALTHY_RTT_MS: u64 = 200;
const DEGRADED_RTT_MS: u64 = 1000;
const UNKNOWN_RTT: u64 = u64::MAX;

/// Link quality derived from the last heartbeat round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    /// Under 200 ms.
    Healthy,
    /// Under one second.
    Degraded,
    /// One second or more.
    Poor,
}

impl ConnectionHealth {
    /// Classify a round-trip time.
    #[must_use]
    pub fn from_latency(rtt: Duration) -> Self {
        match u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX) {
            ms if ms < HEALTHY_RTT_MS => Self::Healthy,
            ms if ms < DEGRADED_RTT_MS => Self::Degraded,
            _ => Self::Poor,
        }
    }
}

/// Tuning for [`SessionTransport`].
#[derive(Debug, Clone)]
pub struct SessionTransportConfig {
    /// Reconnect policy.
    pub retry: RetryConfig,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
}

impl Default for SessionTransportConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::reconnect(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Default)]
struct Shared {
    handlers: HandlerSet,
    connected: AtomicBool,
    connection_id: RwLock<Option<String>>,
    rtt_ms: AtomicU64,
}

impl Shared {
    fn set_connection_id(&self, id: Option<String>) {
        *self
            .connection_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = id;
    }
}

/// WebSocket connection to a queue server.
pub struct SessionTransport {
    url: String,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionTransport {
    /// Start connecting to `url` (for example `ws://127.0.0.1:9474/ws`).
    ///
    /// Must be called inside a Tokio runtime. Subscribers see `Connected`
    /// once the server's welcome arrives.
    #[must_use]
    pub fn connect(url: impl Into<String>, config: SessionTransportConfig) -> Arc<Self> {
        let url = url.into();
        let shared = Arc::new(Shared {
            rtt_ms: AtomicU64::new(UNKNOWN_RTT),
            ..Shared::default()
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            url.clone(),
            Arc::clone(&shared),
            outbound_rx,
            shutdown_rx,
            config,
        ));

        Arc::new(Self {
            url,
            shared,
            outbound,
            shutdown,
            task,
        })
    }

    /// Server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Last measured heartbeat round trip.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        match self.shared.rtt_ms.load(Ordering::Relaxed) {
            UNKNOWN_RTT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Link quality, `None` before the first heartbeat reply.
    #[must_use]
    pub fn health(&self) -> Option<ConnectionHealth> {
        self.latency().map(ConnectionHealth::from_latency)
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Transport for SessionTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Session
    }

    fn peer_id(&self) -> String {
        self.shared
            .connection_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    fn host_id(&self) -> Option<String> {
        None
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn send_data(&self, message: ClientMessage, _target: Option<&str>) -> QueueResult<()> {
        if !self.is_connected() {
            return Err(QueueError::ConnectionLost("not connected".to_string()));
        }
        self.outbound
            .send(message)
            .map_err(|_| QueueError::ConnectionLost("transport closed".to_string()))
    }

    fn subscribe_to_data(&self, handler: DataHandler) -> Subscription {
        self.shared.handlers.subscribe(handler)
    }
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn run(
    url: String,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    config: SessionTransportConfig,
) {
    let mut attempt: u32 = 0;
    loop {
        shared.handlers.notify(&TransportEvent::Connecting);
        let reason = match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                tracing::info!(url = %url, "Connected to queue server");
                let reason = drive(socket, &shared, &mut outbound_rx, &mut shutdown_rx, &config).await;
                shared.connected.store(false, Ordering::Release);
                shared.set_connection_id(None);
                reason
            }
            Err(e) => {
                tracing::warn!(url = %url, attempt, "Connection failed: {}", e);
                e.to_string()
            }
        };
        shared
            .handlers
            .notify(&TransportEvent::Disconnected { reason });

        if *shutdown_rx.borrow() {
            return;
        }
        if attempt >= config.retry.max_retries {
            tracing::warn!(url = %url, "Giving up after {} reconnect attempts", attempt);
            return;
        }
        let delay = config.retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(url = %url, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn drive(
    socket: Socket,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
    config: &SessionTransportConfig,
) -> String {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => on_server_message(shared, outbound_rx, message),
                            Err(e) => tracing::warn!("Unparseable server frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "closed by server".to_string(),
                    Some(Err(e)) => return e.to_string(),
                    Some(Ok(_)) => {}
                }
            }

            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    return "transport dropped".to_string();
                };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize {} frame: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    return e.to_string();
                }
            }

            _ = heartbeat.tick() => {
                if !shared.connected.load(Ordering::Acquire) {
                    continue;
                }
                let frame = ClientMessage::Heartbeat { timestamp: current_timestamp() };
                if let Ok(json) = serde_json::to_string(&frame) {
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        return e.to_string();
                    }
                }
            }

            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return "closed by client".to_string();
            }
        }
    }
}

fn on_server_message(
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    message: ServerMessage,
) {
    match &message {
        ServerMessage::Welcome { connection_id, .. } => {
            // Frames queued for the previous socket are replayed by the agent.
            while outbound_rx.try_recv().is_ok() {}
            shared.set_connection_id(Some(connection_id.clone()));
            shared.connected.store(true, Ordering::Release);
            tracing::debug!(connection_id = %connection_id, "Welcome received");
            shared.handlers.notify(&TransportEvent::Connected);
        }
        ServerMessage::HeartbeatResponse {
            original_timestamp, ..
        } => {
            let rtt = current_timestamp().saturating_sub(*original_timestamp);
            shared.rtt_ms.store(rtt, Ordering::Relaxed);
            let health = ConnectionHealth::from_latency(Duration::from_millis(rtt));
            if health != ConnectionHealth::Healthy {
                tracing::debug!(rtt_ms = rtt, ?health, "Slow heartbeat");
            }
        }
        _ => {}
    }
    shared.handlers.notify(&TransportEvent::Message(message));
}
