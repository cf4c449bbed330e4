//! Multiplexed request/response/event transport over one WebSocket.
//!
//! A single background task owns the socket and the pending-request table.
//! The public handle talks to it through an mpsc command channel with
//! oneshot replies, so reads, writes and timer expiries are serialized.
//!
//! - `connect()` joins an in-flight attempt instead of starting another
//! - every request has its own timer; result, error and timeout each remove
//!   the entry and cancel the timer exactly once
//! - a dropped connection rejects all pending calls and reconnects with
//!   exponential backoff, unless it was never established or closed on purpose

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::rpc::protocol::{InboundFrame, MAX_FRAME_BYTES, RequestFrame, StreamEvent, parse_inbound};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sink for streamed events of one request.
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

/// Connection state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First connection, or a fresh `connect()` after a deliberate close.
    Connected,
    Disconnected,
    /// Connection restored by the backoff loop.
    Reconnected,
}

/// A successful reply with the correlation id it answered.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub request_id: String,
    pub result: Value,
}

// ── Commands ────────────────────────────────────────────────────────

enum TransportCmd {
    Connect {
        reply: oneshot::Sender<Result<(), RpcError>>,
    },
    Request {
        id: String,
        method: String,
        params: Value,
        timeout: Duration,
        events: Option<EventSink>,
        reply: oneshot::Sender<Result<Value, RpcError>>,
    },
    Expire {
        id: String,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

struct PendingRequest {
    method: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<Value, RpcError>>,
    events: Option<EventSink>,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, outcome: Result<Value, RpcError>) {
        self.timer.abort();
        let _ = self.reply.send(outcome);
    }
}

// ── RpcTransport (public handle) ────────────────────────────────────

/// Handle to the worker connection. Create one per worker and share it by `Arc`.
pub struct RpcTransport {
    config: RpcConfig,
    cmd_tx: mpsc::Sender<TransportCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    reconnect_attempts: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl RpcTransport {
    /// Spawn the connection task. Nothing is dialed until `connect()`.
    pub fn new(config: RpcConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        let reconnect_attempts = Arc::new(AtomicU32::new(0));

        let task = ConnectionTask {
            config: config.clone(),
            cmd_rx,
            timer_tx: cmd_tx.downgrade(),
            state_tx,
            events_tx: events_tx.clone(),
            reconnect_attempts: reconnect_attempts.clone(),
            pending: HashMap::new(),
            connect_waiters: Vec::new(),
            ws: None,
            ever_connected: false,
            closed_deliberately: false,
        };
        let task = tokio::spawn(task.run());

        Self {
            config,
            cmd_tx,
            state_rx,
            events_tx,
            reconnect_attempts,
            task,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Connect to the worker. Resolves immediately when already connected
    /// and joins the current attempt when one is in flight.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCmd::Connect { reply })
            .await
            .map_err(|_| RpcError::Shutdown)?;
        rx.await.map_err(|_| RpcError::Shutdown)?
    }

    /// Initial connection with backoff between attempts.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<(), RpcError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= max_attempts => {
                    warn!(attempts = max_attempts, error = %e, "Giving up connecting to worker");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.config.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Worker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close the connection on purpose. Pending calls are rejected and no
    /// reconnect is scheduled.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TransportCmd::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Send a request and wait for its result.
    ///
    /// Fails with `NotConnected` right away unless the transport is connected.
    /// Streamed events for this call are forwarded to `events` when given.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        events: Option<EventSink>,
    ) -> Result<RpcReply, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCmd::Request {
                id: id.clone(),
                method: method.to_string(),
                params,
                timeout,
                events,
                reply,
            })
            .await
            .map_err(|_| RpcError::Shutdown)?;

        let result = rx.await.map_err(|_| RpcError::Shutdown)??;
        Ok(RpcReply {
            request_id: id,
            result,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Failed reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TransportCmd::PendingCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Wait until the transport reaches `target`, up to `limit`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(limit, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Background connection task ──────────────────────────────────────

enum Wake {
    Command(Option<TransportCmd>),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

/// Whether the task should keep running.
type Running = bool;

struct ConnectionTask {
    config: RpcConfig,
    cmd_rx: mpsc::Receiver<TransportCmd>,
    /// Weak so request timers never keep the channel open.
    timer_tx: mpsc::WeakSender<TransportCmd>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    reconnect_attempts: Arc<AtomicU32>,
    pending: HashMap<String, PendingRequest>,
    connect_waiters: Vec<oneshot::Sender<Result<(), RpcError>>>,
    ws: Option<WsStream>,
    ever_connected: bool,
    closed_deliberately: bool,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let running = if self.ws.is_some() {
                self.step_connected().await
            } else if self.ever_connected && !self.closed_deliberately {
                self.step_reconnect().await
            } else {
                self.step_idle().await
            };
            if !running {
                self.reject_all(RpcError::Shutdown);
                debug!("Worker transport task stopped");
                return;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    // ── Idle: never connected, or closed on purpose ─────────────────

    async fn step_idle(&mut self) -> Running {
        match self.cmd_rx.recv().await {
            Some(TransportCmd::Connect { reply }) => {
                self.connect_waiters.push(reply);
                self.closed_deliberately = false;
                self.set_state(ConnectionState::Connecting);
                match self.attempt_connect().await {
                    Some(Ok(ws)) => {
                        info!(url = %self.config.url, "Connected to worker");
                        self.on_established(ws, ConnectionEvent::Connected);
                    }
                    Some(Err(e)) => {
                        warn!(url = %self.config.url, error = %e, "Worker connection failed");
                        self.set_state(ConnectionState::Disconnected);
                        self.answer_waiters(Err(e));
                    }
                    None => return !self.cmd_rx.is_closed(),
                }
                true
            }
            Some(cmd) => self.handle_offline(cmd),
            None => false,
        }
    }

    // ── Reconnecting: backoff, then one attempt ─────────────────────

    async fn step_reconnect(&mut self) -> Running {
        self.set_state(ConnectionState::Reconnecting);
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.config.backoff_delay(attempt);
        info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to worker"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let cmd = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => cmd,
                _ = &mut sleep => break,
            };
            let Some(cmd) = cmd else { return false };
            if !self.handle_offline(cmd) || self.closed_deliberately {
                return true;
            }
        }

        match self.attempt_connect().await {
            Some(Ok(ws)) => {
                info!(attempt = attempt + 1, "Reconnected to worker");
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.on_established(ws, ConnectionEvent::Reconnected);
            }
            Some(Err(e)) => {
                warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                self.answer_waiters(Err(e));
            }
            None => return !self.cmd_rx.is_closed(),
        }
        true
    }

    /// Dial the worker while still serving commands. `None` means the
    /// attempt was abandoned by a disconnect or a closed channel.
    async fn attempt_connect(&mut self) -> Option<Result<WsStream, RpcError>> {
        let url = self.config.url.clone();
        let limit = self.config.connect_timeout;
        let dial = async move {
            match tokio::time::timeout(limit, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(RpcError::ConnectFailed(e.to_string())),
                Err(_) => Err(RpcError::ConnectFailed(format!(
                    "timed out after {limit:?}"
                ))),
            }
        };
        tokio::pin!(dial);

        loop {
            let outcome = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => Err(cmd),
                result = &mut dial => Ok(result),
            };
            match outcome {
                Ok(result) => return Some(result),
                Err(None) => return None,
                Err(Some(TransportCmd::Connect { reply })) => self.connect_waiters.push(reply),
                Err(Some(cmd)) => {
                    self.handle_offline(cmd);
                    if self.closed_deliberately {
                        return None;
                    }
                }
            }
        }
    }

    fn on_established(&mut self, ws: WsStream, event: ConnectionEvent) {
        self.ws = Some(ws);
        self.ever_connected = true;
        self.set_state(ConnectionState::Connected);
        self.emit(event);
        self.answer_waiters(Ok(()));
    }

    fn answer_waiters(&mut self, outcome: Result<(), RpcError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Commands while no socket is open. Returns whether to keep running.
    fn handle_offline(&mut self, cmd: TransportCmd) -> Running {
        match cmd {
            TransportCmd::Connect { reply } => self.connect_waiters.push(reply),
            TransportCmd::Request { reply, .. } => {
                let _ = reply.send(Err(RpcError::NotConnected));
            }
            TransportCmd::Expire { id } => self.expire(&id),
            TransportCmd::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            TransportCmd::Disconnect { reply } => {
                self.closed_deliberately = true;
                self.set_state(ConnectionState::Disconnected);
                self.answer_waiters(Err(RpcError::ConnectFailed(
                    "disconnect requested".into(),
                )));
                let _ = reply.send(());
            }
        }
        true
    }

    // ── Connected: serve commands and inbound frames ────────────────

    async fn step_connected(&mut self) -> Running {
        let wake = {
            let Some(ws) = self.ws.as_mut() else {
                return true;
            };
            tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                frame = ws.next() => Wake::Frame(frame),
            }
        };

        match wake {
            Wake::Command(None) => {
                if let Some(mut ws) = self.ws.take() {
                    let _ = ws.close(None).await;
                }
                false
            }
            Wake::Command(Some(cmd)) => {
                self.handle_connected(cmd).await;
                true
            }
            Wake::Frame(frame) => {
                self.handle_frame(frame).await;
                true
            }
        }
    }

    async fn handle_connected(&mut self, cmd: TransportCmd) {
        match cmd {
            TransportCmd::Connect { reply } => {
                let _ = reply.send(Ok(()));
            }
            TransportCmd::Request {
                id,
                method,
                params,
                timeout,
                events,
                reply,
            } => {
                self.dispatch(id, method, params, timeout, events, reply)
                    .await;
            }
            TransportCmd::Expire { id } => self.expire(&id),
            TransportCmd::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            TransportCmd::Disconnect { reply } => {
                self.closed_deliberately = true;
                if let Some(mut ws) = self.ws.take() {
                    let _ = ws.close(None).await;
                }
                info!("Disconnected from worker");
                self.on_lost();
                let _ = reply.send(());
            }
        }
    }

    async fn dispatch(
        &mut self,
        id: String,
        method: String,
        params: Value,
        timeout: Duration,
        events: Option<EventSink>,
        reply: oneshot::Sender<Result<Value, RpcError>>,
    ) {
        let payload = match serde_json::to_string(&RequestFrame {
            id: &id,
            method: &method,
            params: &params,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(RpcError::SendFailed(e.to_string())));
                return;
            }
        };

        let Some(ws) = self.ws.as_mut() else {
            let _ = reply.send(Err(RpcError::NotConnected));
            return;
        };
        if let Err(e) = ws.send(Message::Text(payload.into())).await {
            warn!(request_id = %id, method = %method, error = %e, "Failed to send request");
            let _ = reply.send(Err(RpcError::SendFailed(e.to_string())));
            self.ws = None;
            self.on_lost();
            return;
        }

        let timer_tx = self.timer_tx.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = timer_tx.upgrade() {
                let _ = tx.send(TransportCmd::Expire { id: timer_id }).await;
            }
        });

        debug!(request_id = %id, method = %method, "Request sent");
        self.pending.insert(
            id,
            PendingRequest {
                method,
                timeout,
                reply,
                events,
                timer,
            },
        );
    }

    fn expire(&mut self, id: &str) {
        if let Some(request) = self.pending.remove(id) {
            warn!(request_id = %id, method = %request.method, "Request timed out");
            let err = RpcError::Timeout {
                method: request.method.clone(),
                timeout: request.timeout,
            };
            request.settle(Err(err));
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => self.route_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => self.route_text(text),
                Err(e) => warn!(error = %e, "Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Ping(payload))) => {
                if let Some(ws) = self.ws.as_mut() {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                info!(reason = ?frame, "Worker closed the connection");
                self.ws = None;
                self.on_lost();
            }
            Some(Err(e)) => {
                warn!(error = %e, "Worker connection error");
                self.ws = None;
                self.on_lost();
            }
            None => {
                info!("Worker connection ended");
                self.ws = None;
                self.on_lost();
            }
        }
    }

    fn route_text(&mut self, text: &str) {
        if text.len() > MAX_FRAME_BYTES {
            warn!(bytes = text.len(), "Dropping oversized frame");
            return;
        }
        let frame = match parse_inbound(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        match frame {
            InboundFrame::Event { id, event } => match self.pending.get(&id) {
                Some(request) => {
                    if let Some(events) = &request.events {
                        let _ = events.send(event);
                    }
                }
                None => debug!(request_id = %id, "Event for unknown request"),
            },
            InboundFrame::Error { id, error } => match self.pending.remove(&id) {
                Some(request) => request.settle(Err(error.into())),
                None => debug!(request_id = %id, "Error for unknown request"),
            },
            InboundFrame::Result { id, result } => match self.pending.remove(&id) {
                Some(request) => request.settle(Ok(result)),
                None => debug!(request_id = %id, "Result for unknown request"),
            },
        }
    }

    /// Connection gone: reject everything in flight and report it.
    fn on_lost(&mut self) {
        let rejected = self.pending.len();
        self.reject_all(RpcError::ConnectionLost);
        if rejected > 0 {
            warn!(rejected, "Rejected pending requests after disconnect");
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected);
    }

    fn reject_all(&mut self, err: RpcError) {
        for (_, request) in self.pending.drain() {
            request.settle(Err(err.clone()));
        }
    }
}
