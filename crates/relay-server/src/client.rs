//! Connection registry and per-socket read/write loops.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use relay_core::messages::RelayMessage;
use relay_core::{ClientId, RelayError};

/// An inbound text frame tagged with the connection it arrived on.
pub type InboundFrame = (ClientId, String);

/// Lifecycle of a registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Registered, socket tasks not running yet.
    Connecting = 0,
    /// Ready to receive broadcasts.
    Open = 1,
    Closing = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closing,
        }
    }
}

/// A connected plugin instance.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<Arc<str>>,
    state: AtomicU8,
    last_pong: AtomicU64,
    dropped_messages: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_pong: AtomicU64::new(now_secs()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue a frame for the socket writer. Returns `false` when the queue is
    /// full or the writer has gone away.
    pub fn send(&self, text: Arc<str>) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    client_id = %self.id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
        }
    }

    /// Register a new connection in the `Connecting` state and return its ID
    /// plus the receiving end of its outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<Arc<str>>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let _ = self
            .clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Mark a connection ready to receive broadcasts.
    pub fn mark_open(&self, id: &ClientId) -> bool {
        match self.clients.get(id) {
            Some(client) if client.state() == ConnectionState::Connecting => {
                client.set_state(ConnectionState::Open);
                true
            }
            _ => false,
        }
    }

    /// Remove a connection. Dropping the entry drops its outbound sender,
    /// which ends the socket writer.
    pub fn unregister(&self, id: &ClientId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.set_state(ConnectionState::Closing);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Run `f` while holding the registry entry for `id`. A concurrent
    /// `unregister` of the same connection waits until `f` returns.
    pub fn with_registered<R>(&self, id: &ClientId, f: impl FnOnce(&Client) -> R) -> Option<R> {
        let entry = self.clients.get(id)?;
        Some(f(entry.value()))
    }

    /// Send a raw frame to one connection, regardless of its state.
    pub fn send_to(&self, id: &ClientId, text: Arc<str>) -> bool {
        match self.clients.get(id) {
            Some(client) => client.send(text),
            None => false,
        }
    }

    /// Serialize and send a message to one connection.
    pub fn send_message(&self, id: &ClientId, message: &RelayMessage) -> Result<bool, RelayError> {
        let json: Arc<str> = serde_json::to_string(message)?.into();
        Ok(self.send_to(id, json))
    }

    /// Invoke `f` for every connection in the `Open` state.
    pub fn for_each_open(&self, mut f: impl FnMut(&Client)) {
        for entry in self.clients.iter() {
            if entry.value().is_open() {
                f(entry.value());
            }
        }
    }

    /// Serialize `message` once and queue the same bytes on every open
    /// connection. Returns how many connections accepted the frame.
    pub fn broadcast(&self, message: &RelayMessage) -> Result<usize, RelayError> {
        let json: Arc<str> = serde_json::to_string(message)?.into();
        let mut sent = 0;
        self.for_each_open(|client| {
            if client.send(Arc::clone(&json)) {
                sent += 1;
            }
        });
        tracing::debug!(kind = %message.kind, recipients = sent, "broadcast");
        Ok(sent)
    }

    /// Number of registered connections, in any state.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn open_count(&self) -> usize {
        let mut n = 0;
        self.for_each_open(|_| n += 1);
        n
    }

    /// Frames dropped on full outbound queues, summed over live connections.
    pub fn dropped_total(&self) -> u64 {
        self.clients.iter().map(|entry| entry.value().drop_count()).sum()
    }

    pub fn record_pong(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }

    /// Remove clients that haven't responded to pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id) {
                removed += 1;
                tracing::info!(client_id = %id, "Cleaned up dead client");
            }
        }
        removed
    }
}

/// Drive one WebSocket: a writer forwarding the outbound queue plus periodic
/// pings, and a reader forwarding text frames to the dispatcher. Returns when
/// either side stops; the caller owns the disconnect cleanup.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<Arc<str>>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<InboundFrame>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(String::from(&*text).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_registry.record_pong(&reader_cid);
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let _ = registry.mark_open(&client_id);

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}

/// Start a background task that periodically cleans up dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "Dead client cleanup");
            }
        }
    })
}
