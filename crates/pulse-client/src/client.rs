//! The hub client: one logical session over a churning transport.
//!
//! State machine: `Disconnected → Connecting → Connected →
//! {Reconnecting → Connecting …} → Disconnected`. The supervisor task owns
//! the socket; callers talk to it through a session channel while
//! connected and a bounded offline queue otherwise.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_core::{ClientAction, ClientFrame, MessageType, ServerEvent, ServerFrame};

use crate::backoff;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Close code the hub uses for policy rejections; not retry-permitted.
const CLOSE_POLICY: u16 = 1008;

/// Client tunables.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket URL of the hub (`ws://…/ws?identity=…`).
    pub url: String,
    /// Ping cadence.
    pub heartbeat_interval: Duration,
    /// Self-close threshold when no pong arrives.
    pub heartbeat_timeout: Duration,
    /// First reconnect delay (ms).
    pub reconnect_initial_ms: u64,
    /// Geometric growth factor per attempt.
    pub reconnect_multiplier: f64,
    /// Reconnect delay ceiling (ms).
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempt ceiling; afterwards the session is terminally down.
    pub max_reconnect_attempts: u32,
    /// Spread reconnect delays by ±20%.
    pub jitter: bool,
    /// Offline queue bound; oldest frames are dropped beyond it.
    pub offline_queue_limit: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(60_000),
            reconnect_initial_ms: 3_000,
            reconnect_multiplier: 1.5,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            jitter: true,
            offline_queue_limit: 256,
        }
    }
}

/// Where the logical session currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

enum SessionEnd {
    /// The transport dropped for a retry-permitted reason.
    Retry,
    /// Deliberate close (local `close()` or a policy close from the hub).
    Terminal,
}

type EventCallback = Box<dyn Fn(ServerFrame) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(String) + Send + Sync>;
type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    event: Option<EventCallback>,
    error: Option<ErrorCallback>,
    state: Option<StateCallback>,
}

pub struct HubClient {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    subscriptions: Mutex<BTreeSet<MessageType>>,
    offline: Mutex<VecDeque<String>>,
    session_tx: Mutex<Option<mpsc::Sender<String>>>,
    callbacks: Mutex<Callbacks>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl HubClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(BTreeSet::new()),
            offline: Mutex::new(VecDeque::new()),
            session_tx: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Register the server-frame callback.
    pub fn on_event(&self, callback: impl Fn(ServerFrame) + Send + Sync + 'static) {
        self.callbacks.lock().event = Some(Box::new(callback));
    }

    /// Register the error callback. Server `error` frames surface here and
    /// never trigger a reconnect by themselves.
    pub fn on_error(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.callbacks.lock().error = Some(Box::new(callback));
    }

    /// Register the state-transition callback.
    pub fn on_state(&self, callback: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.callbacks.lock().state = Some(Box::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Current local subscription set.
    pub fn subscriptions(&self) -> BTreeSet<MessageType> {
        self.subscriptions.lock().clone()
    }

    /// Start the supervisor. Idempotent while connecting or connected.
    pub fn connect(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = Arc::clone(self);
        let _ = tokio::spawn(async move {
            client.run().await;
        });
    }

    /// Terminally close the session. The supervisor will not reconnect.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Queue a frame: written while connected, offline-queued otherwise.
    pub fn send(&self, frame: &ClientFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_raw(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize client frame");
                false
            }
        }
    }

    /// Update the local set and, when connected, emit a `subscribe` frame.
    /// The reserved `error` type is filtered locally; the hub would drop it
    /// anyway.
    pub fn subscribe(&self, types: &[MessageType]) {
        let requested: Vec<MessageType> =
            types.iter().copied().filter(|t| !t.is_reserved()).collect();
        if requested.is_empty() {
            return;
        }
        {
            let mut subs = self.subscriptions.lock();
            subs.extend(requested.iter().copied());
        }
        if self.state() == ConnectionState::Connected {
            let frame = ClientFrame::action(
                MessageType::System,
                ClientAction::Subscribe,
                Some(serde_json::json!({ "types": requested })),
            );
            let _ = self.send(&frame);
        }
    }

    /// Update the local set and, when connected, emit an `unsubscribe` frame.
    pub fn unsubscribe(&self, types: &[MessageType]) {
        {
            let mut subs = self.subscriptions.lock();
            for kind in types {
                let _ = subs.remove(kind);
            }
        }
        if self.state() == ConnectionState::Connected {
            let frame = ClientFrame::action(
                MessageType::System,
                ClientAction::Unsubscribe,
                Some(serde_json::json!({ "types": types })),
            );
            let _ = self.send(&frame);
        }
    }

    fn send_raw(&self, text: String) -> bool {
        let tx = self.session_tx.lock().clone();
        if let Some(tx) = tx {
            match tx.try_send(text) {
                Ok(()) => return true,
                Err(err) => {
                    // Session is saturated or tearing down; keep the frame.
                    self.enqueue_offline(err.into_inner());
                    return false;
                }
            }
        }
        self.enqueue_offline(text);
        false
    }

    /// Bounded offline queue with an explicit drop-oldest policy.
    fn enqueue_offline(&self, text: String) {
        let mut queue = self.offline.lock();
        if queue.len() >= self.config.offline_queue_limit {
            let _ = queue.pop_front();
            debug!("offline queue full, dropped oldest frame");
        }
        queue.push_back(text);
    }

    #[cfg(test)]
    fn offline_len(&self) -> usize {
        self.offline.lock().len()
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        let callbacks = self.callbacks.lock();
        if let Some(cb) = &callbacks.state {
            cb(next);
        }
    }

    fn emit_error(&self, message: String) {
        warn!(%message, "hub client error");
        let callbacks = self.callbacks.lock();
        if let Some(cb) = &callbacks.error {
            cb(message);
        }
    }

    fn emit_event(&self, frame: ServerFrame) {
        let callbacks = self.callbacks.lock();
        if let Some(cb) = &callbacks.event {
            cb(frame);
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let ms = if self.config.jitter {
            backoff::reconnect_delay_with_random(
                attempt,
                self.config.reconnect_initial_ms,
                self.config.reconnect_multiplier,
                self.config.reconnect_max_delay_ms,
                rand::random::<f64>(),
            )
        } else {
            backoff::reconnect_delay_ms(
                attempt,
                self.config.reconnect_initial_ms,
                self.config.reconnect_multiplier,
                self.config.reconnect_max_delay_ms,
            )
        };
        Duration::from_millis(ms)
    }

    async fn run(&self) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _response)) => {
                    attempt = 0;
                    info!(url = %self.config.url, "connected to hub");
                    self.set_state(ConnectionState::Connected);
                    let end = self.drive_session(ws).await;
                    let _ = self.session_tx.lock().take();
                    if matches!(end, SessionEnd::Terminal) {
                        break;
                    }
                }
                Err(e) => {
                    self.emit_error(format!("connect failed: {e}"));
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                self.emit_error("reconnect attempts exhausted".to_owned());
                break;
            }
            self.set_state(ConnectionState::Reconnecting);
            let delay = self.reconnect_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drive one connected transport until it drops.
    ///
    /// On entry: flush the offline queue FIFO, then resubscribe the full
    /// local set in a single `subscribe` frame.
    async fn drive_session(&self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::channel::<String>(64);
        *self.session_tx.lock() = Some(tx);

        let queued: Vec<String> = {
            let mut queue = self.offline.lock();
            queue.drain(..).collect()
        };
        for text in queued {
            if sink.send(Message::Text(text.into())).await.is_err() {
                return SessionEnd::Retry;
            }
        }

        let subs: Vec<MessageType> = self.subscriptions.lock().iter().copied().collect();
        if !subs.is_empty() {
            let frame = ClientFrame::action(
                MessageType::System,
                ClientAction::Subscribe,
                Some(serde_json::json!({ "types": subs })),
            );
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return SessionEnd::Retry;
                    }
                }
                Err(e) => self.emit_error(format!("failed to serialize resubscribe: {e}")),
            }
        }

        let mut ping = tokio::time::interval(self.config.heartbeat_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // consume the immediate first tick
        let mut liveness = tokio::time::interval(
            self.config
                .heartbeat_timeout
                .min(Duration::from_secs(5))
                .max(Duration::from_millis(10)),
        );
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Terminal;
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(text.as_str()) {
                                Ok(frame) => {
                                    if frame.event == ServerEvent::Pong {
                                        last_pong = Instant::now();
                                    }
                                    if frame.event == ServerEvent::Error {
                                        // Surfaced, but never a reconnect trigger.
                                        self.emit_error(frame.data.to_string());
                                    }
                                    self.emit_event(frame);
                                }
                                Err(e) => {
                                    debug!(error = %e, "ignoring unparseable server frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let retry = frame
                                .as_ref()
                                .map_or(true, |f| u16::from(f.code) != CLOSE_POLICY);
                            if let Some(f) = &frame {
                                info!(code = u16::from(f.code), reason = %f.reason, "hub closed the session");
                            }
                            return if retry { SessionEnd::Retry } else { SessionEnd::Terminal };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.emit_error(format!("transport error: {e}"));
                            return SessionEnd::Retry;
                        }
                        None => return SessionEnd::Retry,
                    }
                }
                Some(text) = rx.recv() => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return SessionEnd::Retry;
                    }
                }
                _ = ping.tick() => {
                    let frame = ClientFrame::action(MessageType::System, ClientAction::Ping, None);
                    if let Ok(text) = serde_json::to_string(&frame) {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return SessionEnd::Retry;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_timeout {
                        self.emit_error("heartbeat timeout, closing transport".to_owned());
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Retry;
                    }
                }
            }
        }
    }
}
