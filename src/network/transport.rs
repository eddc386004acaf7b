//! Persistent WebSocket transport to the speech backend
//!
//! One supervisor task per connection generation owns the socket. It dials,
//! pumps outbound frames from a bounded channel, hands inbound binary
//! payloads to the registered [`InboundSink`] in arrival order, and redials
//! with backoff when the link drops. Callers never block: `send` is a
//! `try_send`, and `close` settles the state itself before signalling the
//! supervisor.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::constants::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_OUTBOUND_CHANNEL_DEPTH, DEFAULT_RELAY_URL};
use crate::error::{CodecError, ErrorKind, NetworkError};
use crate::events::{EventBus, RelayEvent};
use crate::network::outbound::{Outbound, OutboundPolicy, OutboundQueue};
use crate::network::state::{Backoff, ConnectionState, ConnectionStateCell, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Consumer of inbound audio payloads, called on the network clock
pub trait InboundSink: Send + Sync {
    /// Handle one binary message. `Ok(Some(text))` asks the transport to
    /// send `text` back to the backend.
    fn on_audio(&self, payload: &[u8]) -> Result<Option<String>, CodecError>;
}

/// Transport settings, resolved once at construction
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <key>` on the handshake when set
    pub api_key: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub outbound: OutboundPolicy,
    pub channel_depth: usize,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            api_key: None,
            reconnect: ReconnectPolicy::default(),
            outbound: OutboundPolicy::default(),
            channel_depth: DEFAULT_OUTBOUND_CHANNEL_DEPTH,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub state: ConnectionState,
    pub connects: u64,
    pub reconnect_attempts: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    reconnect_attempts: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct Shared {
    state: ConnectionStateCell,
    /// Current supervisor generation; state changes are serialized on it
    generation: Mutex<u64>,
    url: Mutex<String>,
    api_key: Option<String>,
    auto_reconnect: AtomicBool,
    counters: Counters,
    last_connected_at: Mutex<Option<DateTime<Utc>>>,
    bus: EventBus,
    sink: Arc<dyn InboundSink>,
}

impl Shared {
    /// Apply a state change made by the supervisor of `generation`.
    /// Stale supervisors are ignored.
    fn transition(&self, generation: u64, state: ConnectionState, extra: Option<RelayEvent>) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.set_state(state);
        if let Some(event) = extra {
            self.bus.publish(event);
        }
        true
    }

    /// Caller holds the generation lock
    fn set_state(&self, state: ConnectionState) {
        if self.state.swap(state) != state {
            self.bus.publish(RelayEvent::StateChanged(state));
        }
    }

    fn count_dropped(&self, frames: u64) {
        self.counters.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }
}

struct Session {
    tx: mpsc::Sender<Outbound>,
    shutdown: Arc<Notify>,
}

/// Duplex connection to the backend with automatic reconnection
pub struct RelayTransport {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    config: TransportConfig,
}

impl RelayTransport {
    pub fn new(config: TransportConfig, bus: EventBus, sink: Arc<dyn InboundSink>) -> Self {
        let shared = Arc::new(Shared {
            state: ConnectionStateCell::default(),
            generation: Mutex::new(0),
            url: Mutex::new(config.url.clone()),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            auto_reconnect: AtomicBool::new(config.reconnect.enabled),
            counters: Counters::default(),
            last_connected_at: Mutex::new(None),
            bus,
            sink,
        });
        Self {
            shared,
            session: Mutex::new(None),
            config,
        }
    }

    /// Start connecting to `url`. Must be called from within a tokio runtime.
    ///
    /// The outcome is reported asynchronously: `Connected` on success, an
    /// `Error { kind: Connect, .. }` notification on failure. A no-op while
    /// already connecting or connected.
    pub fn connect(&self, url: &str) -> Result<(), NetworkError> {
        let parsed = validate_url(url)?;
        let state = self.state();
        if state.is_active() {
            tracing::debug!(%state, "connect() ignored, transport already active");
            return Ok(());
        }
        *self.shared.url.lock() = parsed.to_string();
        self.spawn_session()
    }

    /// Queue one PCM16 frame. Returns false if the frame was dropped.
    pub fn send(&self, frame: impl Into<Bytes>) -> bool {
        self.enqueue(Outbound::Audio(frame.into()))
    }

    /// Queue a control text message, same drop rules as [`RelayTransport::send`]
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.enqueue(Outbound::Text(text.into()))
    }

    fn enqueue(&self, message: Outbound) -> bool {
        if self.state() != ConnectionState::Connected && self.config.outbound == OutboundPolicy::Drop {
            self.shared.count_dropped(1);
            return false;
        }

        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            self.shared.count_dropped(1);
            return false;
        };
        match session.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Outbound channel full, dropping frame");
                self.shared.count_dropped(1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.count_dropped(1);
                false
            }
        }
    }

    /// Close the connection without triggering a reconnect.
    ///
    /// The reconnect flag itself is left as is; the next `connect` obeys it.
    /// The state is `Disconnected` when this returns; the supervisor sends
    /// the close frame and drains its queue in the background.
    pub fn close(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        {
            // Retire the supervisor so its late transitions are ignored
            let mut generation = self.shared.generation.lock();
            *generation += 1;
            let previous = self.shared.state.load();
            if previous.is_active() {
                self.shared.set_state(ConnectionState::Closing);
            }
            self.shared.set_state(ConnectionState::Disconnected);
            if previous == ConnectionState::Connected {
                self.shared.bus.publish(RelayEvent::Disconnected);
            }
        }
        session.shutdown.notify_one();
        tracing::info!("Relay transport closing");
    }

    /// Drop the current connection (if any) and dial again right away.
    /// Re-enables automatic reconnection.
    pub fn reconnect(&self) -> Result<(), NetworkError> {
        self.shared.auto_reconnect.store(true, Ordering::SeqCst);
        tracing::info!(url = %self.url(), "Manual reconnect");
        self.spawn_session()
    }

    /// Switch to another backend URL, reconnecting if currently active
    pub fn change_url(&self, url: &str) -> Result<(), NetworkError> {
        let parsed = validate_url(url)?;
        *self.shared.url.lock() = parsed.to_string();
        tracing::info!(url = %parsed, "Relay URL changed");
        if self.state().is_active() {
            self.spawn_session()?;
        }
        Ok(())
    }

    fn spawn_session(&self) -> Result<(), NetworkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NetworkError::Connect(format!("no tokio runtime: {e}")))?;

        let mut session = self.session.lock();
        if let Some(old) = session.take() {
            old.shutdown.notify_one();
        }

        let (tx, rx) = mpsc::channel(self.config.channel_depth.max(1));
        let shutdown = Arc::new(Notify::new());
        let generation = {
            let mut current = self.shared.generation.lock();
            *current += 1;
            if self.shared.state.load() == ConnectionState::Connected {
                self.shared.bus.publish(RelayEvent::Disconnected);
            }
            self.shared.set_state(ConnectionState::Connecting);
            *current
        };

        let supervisor = Supervisor {
            shared: self.shared.clone(),
            generation,
            rx,
            shutdown: shutdown.clone(),
            queue: OutboundQueue::new(self.config.outbound),
            reconnect: self.config.reconnect,
            connect_timeout: self.config.connect_timeout,
        };
        runtime.spawn(supervisor.run());

        *session = Some(Session { tx, shutdown });
        Ok(())
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.shared.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// "connected", "connecting" or "disconnected"
    pub fn status_label(&self) -> &'static str {
        match self.state() {
            ConnectionState::Closing => ConnectionState::Disconnected.label(),
            state => state.label(),
        }
    }

    pub fn url(&self) -> String {
        self.shared.url.lock().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        TransportStats {
            state: self.state(),
            connects: c.connects.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            last_connected_at: *self.shared.last_connected_at.lock(),
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse and check a backend URL
pub fn validate_url(url: &str) -> Result<Url, NetworkError> {
    let parsed = Url::parse(url).map_err(|e| NetworkError::InvalidUrl(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(NetworkError::InvalidUrl(format!("{url}: expected ws:// or wss://")));
    }
    if parsed.host_str().is_none() {
        return Err(NetworkError::InvalidUrl(format!("{url}: missing host")));
    }
    Ok(parsed)
}

async fn open(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<WsStream, NetworkError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;
    if let Some(key) = api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| NetworkError::Connect(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(NetworkError::Connect(e.to_string())),
        Err(_) => Err(NetworkError::Connect(format!("timed out after {timeout:?}"))),
    }
}

/// How a connected link ended
enum LinkEnd {
    Shutdown,
    Lost,
}

struct Supervisor {
    shared: Arc<Shared>,
    generation: u64,
    rx: mpsc::Receiver<Outbound>,
    shutdown: Arc<Notify>,
    queue: OutboundQueue,
    reconnect: ReconnectPolicy,
    connect_timeout: Duration,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = Backoff::new(&self.reconnect);

        loop {
            if !self.shared.transition(self.generation, ConnectionState::Connecting, None) {
                return;
            }
            let url = self.shared.url.lock().clone();
            tracing::info!(url = %url, "Connecting to relay");

            let attempt = tokio::select! {
                result = open(&url, self.shared.api_key.as_deref(), self.connect_timeout) => result,
                _ = self.shutdown.notified() => {
                    self.finish(None);
                    return;
                }
            };

            match attempt {
                Ok(ws) => {
                    backoff.reset();
                    self.shared.counters.connects.fetch_add(1, Ordering::Relaxed);
                    *self.shared.last_connected_at.lock() = Some(Utc::now());
                    tracing::info!(url = %url, "Relay connected");
                    self.shared
                        .transition(self.generation, ConnectionState::Connected, Some(RelayEvent::Connected));

                    match self.pump(ws).await {
                        LinkEnd::Shutdown => {
                            self.finish(None);
                            return;
                        }
                        LinkEnd::Lost => {
                            tracing::warn!(url = %url, "Relay connection lost");
                            self.shared.transition(
                                self.generation,
                                ConnectionState::Disconnected,
                                Some(RelayEvent::Disconnected),
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %url, "Relay connect failed: {}", e);
                    self.shared.transition(
                        self.generation,
                        ConnectionState::Disconnected,
                        Some(RelayEvent::error(e.kind(), e.to_string())),
                    );
                }
            }

            if !self.shared.auto_reconnect.load(Ordering::SeqCst) {
                tracing::info!("Auto-reconnect disabled, transport idle");
                self.discard_pending();
                return;
            }

            let delay = backoff.next_delay();
            self.shared.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Reconnecting in {:?}", delay);
            if !self.wait(delay).await {
                self.finish(None);
                return;
            }
        }
    }

    /// Sleep out the backoff, holding outbound messages meanwhile.
    /// Returns false on shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.notified() => return false,
                message = self.rx.recv() => match message {
                    Some(message) => self.hold(message),
                    None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, ws: WsStream) -> LinkEnd {
        let (mut write, mut read) = ws.split();

        let pending: Vec<Outbound> = self.queue.drain().collect();
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Flushing queued frames");
        }
        for message in pending {
            if !self.write_one(&mut write, message).await {
                return LinkEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return LinkEnd::Shutdown;
                }
                message = self.rx.recv() => match message {
                    Some(message) => {
                        if !self.write_one(&mut write, message).await {
                            return LinkEnd::Lost;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return LinkEnd::Shutdown;
                    }
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if !self.deliver(&mut write, &data).await {
                            return LinkEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(len = text.len(), "Received text");
                        self.shared.bus.publish(RelayEvent::TextReceived(text.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "Server closed connection");
                        return LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Relay read failed: {}", e);
                        return LinkEnd::Lost;
                    }
                    None => return LinkEnd::Lost,
                },
            }
        }
    }

    async fn deliver(&mut self, write: &mut WsWriter, payload: &[u8]) -> bool {
        self.shared
            .counters
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        match self.shared.sink.on_audio(payload) {
            Ok(Some(reply)) => self.write_one(write, Outbound::Text(reply)).await,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("Dropping inbound frame: {}", e);
                let error = NetworkError::Protocol(e.to_string());
                self.shared.bus.publish(RelayEvent::error(error.kind(), error.to_string()));
                true
            }
        }
    }

    /// Returns false if the socket failed
    async fn write_one(&mut self, write: &mut WsWriter, message: Outbound) -> bool {
        let len = message.len() as u64;
        match write.send(message.into_message()).await {
            Ok(()) => {
                let c = &self.shared.counters;
                c.frames_sent.fetch_add(1, Ordering::Relaxed);
                c.bytes_sent.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!("Relay send failed: {}", e);
                self.shared.count_dropped(1);
                let error = NetworkError::Send(e.to_string());
                self.shared.bus.publish(RelayEvent::error(ErrorKind::Send, error.to_string()));
                false
            }
        }
    }

    fn hold(&mut self, message: Outbound) {
        let before = self.queue.dropped();
        self.queue.hold(message);
        self.shared.count_dropped(self.queue.dropped() - before);
    }

    fn discard_pending(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.hold(message);
        }
        let pending = self.queue.drain().count() as u64;
        self.shared.count_dropped(pending);
    }

    fn finish(&mut self, extra: Option<RelayEvent>) {
        self.discard_pending();
        self.shared
            .transition(self.generation, ConnectionState::Disconnected, extra);
        tracing::info!("Relay transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;
    use tokio::time::{timeout, Instant};

    type ServerWs = WebSocketStream<TcpStream>;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Vec<u8>>>,
        reply: Option<String>,
    }

    impl InboundSink for RecordingSink {
        fn on_audio(&self, payload: &[u8]) -> Result<Option<String>, CodecError> {
            if payload.len() % 2 != 0 {
                return Err(CodecError::OddLength(payload.len()));
            }
            self.frames.lock().push(payload.to_vec());
            Ok(self.reply.clone())
        }
    }

    async fn server() -> (String, mpsc::UnboundedReceiver<ServerWs>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/audio", listener.local_addr().unwrap());
        (url, serve(listener))
    }

    fn serve(listener: TcpListener) -> mpsc::UnboundedReceiver<ServerWs> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }

    fn config(url: &str, reconnect: ReconnectPolicy, outbound: OutboundPolicy) -> TransportConfig {
        TransportConfig {
            url: url.to_string(),
            api_key: None,
            reconnect,
            outbound,
            channel_depth: 16,
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<RelayEvent>, mut matches: F) -> RelayEvent
    where
        F: FnMut(&RelayEvent) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn accept(rx: &mut mpsc::UnboundedReceiver<ServerWs>) -> ServerWs {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    async fn next_binary(ws: &mut ServerWs) -> Vec<u8> {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Binary(data) = message {
                return data.to_vec();
            }
        }
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("ws://127.0.0.1:8000/ws/audio").is_ok());
        assert!(validate_url("wss://relay.example.com/ws").is_ok());
        assert!(matches!(validate_url("http://example.com"), Err(NetworkError::InvalidUrl(_))));
        assert!(matches!(validate_url("not a url"), Err(NetworkError::InvalidUrl(_))));
    }

    #[test]
    fn test_connect_outside_runtime_fails() {
        let transport = RelayTransport::new(
            TransportConfig::default(),
            EventBus::default(),
            Arc::new(RecordingSink::default()),
        );
        assert!(matches!(
            transport.connect("ws://127.0.0.1:9/ws"),
            Err(NetworkError::Connect(_))
        ));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (url, mut accepted) = server().await;
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let transport = RelayTransport::new(
            config(&url, ReconnectPolicy::disabled(), OutboundPolicy::Drop),
            bus,
            Arc::new(RecordingSink::default()),
        );

        // Not connected yet: dropped, not queued
        assert!(!transport.send(vec![1u8, 2]));
        assert_eq!(transport.stats().frames_dropped, 1);

        transport.connect(&url).unwrap();
        let mut server_ws = accept(&mut accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;
        assert_eq!(transport.status_label(), "connected");

        assert!(transport.send(vec![0u8, 1, 2, 3]));
        assert_eq!(next_binary(&mut server_ws).await, vec![0, 1, 2, 3]);

        // Connecting again while connected is a no-op
        transport.connect(&url).unwrap();
        assert!(transport.is_connected());

        let stats = transport.stats();
        assert_eq!(stats.connects, 1);
        assert!(stats.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn test_inbound_frames_in_order() {
        let (url, mut accepted) = server().await;
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let sink = Arc::new(RecordingSink {
            reply: None,
            ..RecordingSink::default()
        });
        let transport = RelayTransport::new(
            config(&url, ReconnectPolicy::disabled(), OutboundPolicy::Drop),
            bus,
            sink.clone(),
        );
        transport.connect(&url).unwrap();
        let mut server_ws = accept(&mut accepted).await;

        for i in 0..3u8 {
            server_ws.send(Message::Binary(Bytes::from(vec![i, i]))).await.unwrap();
        }
        server_ws.send(Message::text("{\"type\":\"transcript\"}")).await.unwrap();
        server_ws.send(Message::Binary(Bytes::from(vec![9u8]))).await.unwrap();

        match wait_for(&mut events, |e| matches!(e, RelayEvent::TextReceived(_))).await {
            RelayEvent::TextReceived(text) => assert!(text.contains("transcript")),
            _ => unreachable!(),
        }
        match wait_for(&mut events, |e| matches!(e, RelayEvent::Error { .. })).await {
            RelayEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Protocol),
            _ => unreachable!(),
        }

        assert_eq!(*sink.frames.lock(), vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
        // A bad frame does not drop the connection
        assert!(transport.is_connected());
        assert_eq!(transport.stats().bytes_received, 7);
    }

    #[tokio::test]
    async fn test_sink_reply_is_sent_back() {
        let (url, mut accepted) = server().await;
        let sink = Arc::new(RecordingSink {
            reply: Some("{\"type\":\"backpressure\"}".to_string()),
            ..RecordingSink::default()
        });
        let transport = RelayTransport::new(
            config(&url, ReconnectPolicy::disabled(), OutboundPolicy::Drop),
            EventBus::default(),
            sink,
        );
        transport.connect(&url).unwrap();
        let mut server_ws = accept(&mut accepted).await;

        server_ws.send(Message::Binary(Bytes::from(vec![0u8, 0]))).await.unwrap();
        let reply = timeout(Duration::from_secs(5), server_ws.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::text("{\"type\":\"backpressure\"}"));
    }

    #[tokio::test]
    async fn test_unexpected_close_reconnects_after_interval() {
        let (url, mut accepted) = server().await;
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let interval = Duration::from_millis(200);
        let transport = RelayTransport::new(
            config(&url, ReconnectPolicy::fixed(interval), OutboundPolicy::Drop),
            bus,
            Arc::new(RecordingSink::default()),
        );
        transport.connect(&url).unwrap();
        let mut first = accept(&mut accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;

        first.close(None).await.unwrap();

        wait_for(&mut events, |e| matches!(e, RelayEvent::Disconnected)).await;
        let lost_at = Instant::now();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.send(vec![0u8, 0]));

        wait_for(&mut events, |e| {
            matches!(e, RelayEvent::StateChanged(ConnectionState::Connecting))
        })
        .await;
        assert!(lost_at.elapsed() >= interval - Duration::from_millis(20));

        let _second = accept(&mut accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;
        let stats = transport.stats();
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn test_queue_and_flush_after_reconnect() {
        let (url, mut accepted) = server().await;
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let transport = RelayTransport::new(
            config(
                &url,
                ReconnectPolicy::fixed(Duration::from_millis(300)),
                OutboundPolicy::QueueAndFlush { max_frames: 2 },
            ),
            bus,
            Arc::new(RecordingSink::default()),
        );
        transport.connect(&url).unwrap();
        let mut first = accept(&mut accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;

        first.close(None).await.unwrap();
        wait_for(&mut events, |e| matches!(e, RelayEvent::Disconnected)).await;

        for tag in 1..=3u8 {
            assert!(transport.send(vec![tag, 0]));
        }

        let mut second = accept(&mut accepted).await;
        assert_eq!(next_binary(&mut second).await, vec![2, 0]);
        assert_eq!(next_binary(&mut second).await, vec![3, 0]);
        assert_eq!(transport.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_close_does_not_reconnect() {
        let (url, mut accepted) = server().await;
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let transport = RelayTransport::new(
            config(&url, ReconnectPolicy::fixed(Duration::from_millis(50)), OutboundPolicy::Drop),
            bus,
            Arc::new(RecordingSink::default()),
        );
        transport.connect(&url).unwrap();
        let _server_ws = accept(&mut accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;

        transport.close();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.status_label(), "disconnected");
        wait_for(&mut events, |e| {
            matches!(e, RelayEvent::StateChanged(ConnectionState::Closing))
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, RelayEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Disconnected)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(accepted.try_recv().is_err());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.auto_reconnect());

        // Closing twice is harmless
        transport.close();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/audio", listener.local_addr().unwrap());
        drop(listener);

        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let transport = RelayTransport::new(
            config(&url, ReconnectPolicy::disabled(), OutboundPolicy::Drop),
            bus,
            Arc::new(RecordingSink::default()),
        );
        transport.connect(&url).unwrap();
        assert_eq!(transport.state(), ConnectionState::Connecting);

        match wait_for(&mut events, |e| matches!(e, RelayEvent::Error { .. })).await {
            RelayEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Connect),
            _ => unreachable!(),
        }
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_retries_with_backoff() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);
        let url = format!("ws://{addr}/ws/audio");

        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let policy = ReconnectPolicy {
            enabled: true,
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
        };
        let transport = RelayTransport::new(
            config(&url, policy, OutboundPolicy::Drop),
            bus,
            Arc::new(RecordingSink::default()),
        );
        transport.connect(&url).unwrap();

        let is_connect_error = |e: &RelayEvent| {
            matches!(
                e,
                RelayEvent::Error {
                    kind: ErrorKind::Connect,
                    ..
                }
            )
        };
        wait_for(&mut events, is_connect_error).await;
        let first_failure = Instant::now();
        wait_for(&mut events, is_connect_error).await;
        let second_failure = Instant::now();
        assert!(second_failure - first_failure >= Duration::from_millis(90));

        // Backend comes up while the doubled delay is pending
        let mut accepted = serve(TcpListener::bind(addr).await.unwrap());
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;
        assert!(second_failure.elapsed() >= Duration::from_millis(180));
        let _server_ws = accept(&mut accepted).await;

        let stats = transport.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.reconnect_attempts, 2);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_change_url_reconnects() {
        let (first_url, mut first_accepted) = server().await;
        let (second_url, mut second_accepted) = server().await;
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let transport = RelayTransport::new(
            config(&first_url, ReconnectPolicy::disabled(), OutboundPolicy::Drop),
            bus,
            Arc::new(RecordingSink::default()),
        );
        transport.connect(&first_url).unwrap();
        let _first = accept(&mut first_accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;

        transport.change_url(&second_url).unwrap();
        let _second = accept(&mut second_accepted).await;
        wait_for(&mut events, |e| matches!(e, RelayEvent::Connected)).await;
        assert_eq!(transport.url(), second_url);
        assert!(transport.change_url("ftp://nope").is_err());
    }
}
