//! Room-based CRDT sync engine behind the gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 (admission pending: frames held)
//!             ├── Room (path) ── Yrs Doc ── BroadcastGroup
//! Client B ──┘                                  │
//!                                    ┌──────────┼───────────┐
//!                                    ▼          ▼           ▼
//!                                 Client A   Client B    Client C
//! ```
//!
//! Each document maintains:
//! - A Yrs `Doc` for authoritative state
//! - A `BroadcastGroup` for fan-out to connected peers
//!
//! A document is created when its first admitted connection arrives and
//! dropped when its last one leaves. Nothing is persisted.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::ReadTxn;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::gate::{
    AUTH_TIMEOUT_CLOSE_CODE, AUTH_TIMEOUT_REASON, UNAUTHORIZED_CLOSE_CODE, UNAUTHORIZED_REASON,
};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::registry::RoomId;

/// Close code sent to live sessions when the engine shuts down.
pub const SHUTDOWN_CLOSE_CODE: u16 = 1001;
pub const SHUTDOWN_REASON: &str = "Server shutting down";

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Longest a session may wait for its authorization
    pub auth_timeout: Duration,
    /// Frames held per session while authorization is pending
    pub pending_message_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            auth_timeout: Duration::from_secs(5),
            pending_message_limit: 64,
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub rejected_sessions: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub open_documents: usize,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Authorization denied; closed with 4001
    Rejected,
    /// Authorization did not resolve in time; closed with 4008
    TimedOut,
    /// Client went away, or a transport error occurred
    Disconnected,
    /// Engine closed; closed with 1001
    Shutdown,
}

/// Document room: Yrs Doc + broadcast group.
struct DocumentRoom {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

/// State of one admitted connection.
struct Session {
    connection_id: Uuid,
    /// Announced via PeerJoined; the connection id until then
    peer_id: Uuid,
    document: String,
    broadcast: Arc<BroadcastGroup>,
}

/// Counts a running [`SyncEngine::serve`] call.
struct LiveSession<'a> {
    engine: &'a SyncEngine,
}

impl Drop for LiveSession<'_> {
    fn drop(&mut self) {
        if self.engine.live_sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.engine.drained.notify_waiters();
        }
    }
}

/// The sync engine.
pub struct SyncEngine {
    config: EngineConfig,
    /// Open documents keyed by room name ("" for connections without a room)
    documents: RwLock<HashMap<String, DocumentRoom>>,
    stats: RwLock<EngineStats>,
    shutdown: watch::Sender<bool>,
    live_sessions: AtomicUsize,
    drained: Notify,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            documents: RwLock::new(HashMap::new()),
            stats: RwLock::new(EngineStats::default()),
            shutdown,
            live_sessions: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Names of all currently open documents.
    pub async fn document_ids(&self) -> Vec<String> {
        self.documents.read().await.keys().cloned().collect()
    }

    /// Visit the open document names while the document table is locked.
    ///
    /// No document can be opened or dropped until `f` returns, so `f` must
    /// not wait on the engine.
    pub async fn with_document_ids<R>(&self, f: impl FnOnce(&mut dyn Iterator<Item = &str>) -> R) -> R {
        let documents = self.documents.read().await;
        f(&mut documents.keys().map(String::as_str))
    }

    /// Open an empty document without a connection. Returns false if it
    /// was already open.
    ///
    /// The document is dropped by [`Self::close_document`], or when the
    /// last session to join it leaves.
    pub async fn open_document(&self, name: &str) -> bool {
        let mut documents = self.documents.write().await;
        if documents.contains_key(name) {
            return false;
        }
        documents.insert(name.to_string(), DocumentRoom::new(self.config.broadcast_capacity));
        let open = documents.len();
        drop(documents);
        self.stats.write().await.open_documents = open;
        log::info!("Opened document '{name}'");
        true
    }

    /// Drop a document regardless of connected peers.
    pub async fn close_document(&self, name: &str) -> bool {
        let mut documents = self.documents.write().await;
        let removed = documents.remove(name).is_some();
        let open = documents.len();
        drop(documents);
        self.stats.write().await.open_documents = open;
        removed
    }

    /// Text content of a root-level text type, if the document is open.
    pub async fn read_text(&self, document: &str, name: &str) -> Option<String> {
        use yrs::GetString;
        let documents = self.documents.read().await;
        let room = documents.get(document)?;
        let txn = yrs::Transact::transact(&room.doc);
        let text = txn.get_text(name)?;
        Some(text.get_string(&txn))
    }

    /// Close every live session with 1001 and refuse new ones.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        log::info!("Sync engine closing");
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of [`Self::serve`] calls still running.
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::Acquire)
    }

    /// Wait until no session is running.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_sessions() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn enter(&self) -> LiveSession<'_> {
        self.live_sessions.fetch_add(1, Ordering::AcqRel);
        LiveSession { engine: self }
    }

    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Run one connection to completion.
    ///
    /// `authorization` is the deferred admission decision. No inbound frame
    /// is processed, and nothing is sent, before it resolves; frames that
    /// arrive meanwhile are held in order up to `pending_message_limit`.
    pub async fn serve<A>(&self, socket: WebSocket, room: Option<RoomId>, authorization: A) -> SessionEnd
    where
        A: Future<Output = bool>,
    {
        let _live = self.enter();
        let connection_id = Uuid::new_v4();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut shutdown = self.shutdown.subscribe();
        self.stats.write().await.total_sessions += 1;

        if *shutdown.borrow_and_update() {
            close_with(&mut ws_sender, SHUTDOWN_CLOSE_CODE, SHUTDOWN_REASON).await;
            return SessionEnd::Shutdown;
        }

        let mut held: VecDeque<Bytes> = VecDeque::new();
        let deadline = Instant::now() + self.config.auth_timeout;
        let mut authorization = std::pin::pin!(authorization);

        let granted = loop {
            tokio::select! {
                granted = &mut authorization => break granted,

                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if held.len() < self.config.pending_message_limit {
                            held.push_back(data);
                        } else {
                            log::warn!("Dropping frame from pending connection {connection_id}: hold limit reached");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {connection_id} closed before admission resolved");
                        return SessionEnd::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on pending connection {connection_id}: {e}");
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {}
                },

                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("Connection {connection_id} timed out waiting for authorization");
                    close_with(&mut ws_sender, AUTH_TIMEOUT_CLOSE_CODE, AUTH_TIMEOUT_REASON).await;
                    return SessionEnd::TimedOut;
                }

                _ = shutdown.changed() => {
                    close_with(&mut ws_sender, SHUTDOWN_CLOSE_CODE, SHUTDOWN_REASON).await;
                    return SessionEnd::Shutdown;
                }
            }
        };

        if !granted {
            close_with(&mut ws_sender, UNAUTHORIZED_CLOSE_CODE, UNAUTHORIZED_REASON).await;
            self.stats.write().await.rejected_sessions += 1;
            return SessionEnd::Rejected;
        }

        let document = room.map(|r| r.to_string()).unwrap_or_default();
        let (mut session, mut broadcast_rx, state) = self.open(document, connection_id).await;
        self.stats.write().await.active_sessions += 1;

        let end = self
            .run_session(
                &mut session,
                &mut ws_sender,
                &mut ws_receiver,
                &mut broadcast_rx,
                &mut shutdown,
                state,
                held,
            )
            .await;

        self.leave(&session).await;
        {
            let mut s = self.stats.write().await;
            s.active_sessions = s.active_sessions.saturating_sub(1);
        }
        log::info!("Connection {connection_id} left document '{}'", session.document);
        end
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        &self,
        session: &mut Session,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        broadcast_rx: &mut broadcast::Receiver<Frame>,
        shutdown: &mut watch::Receiver<bool>,
        state: Vec<u8>,
        held: VecDeque<Bytes>,
    ) -> SessionEnd {
        // Full document state first, then whatever arrived while pending.
        let initial = SyncMessage::sync_step2(Uuid::nil(), state);
        if let Err(e) = send(ws_sender, &initial).await {
            log::warn!("Failed to send initial state to {}: {e}", session.connection_id);
            return SessionEnd::Disconnected;
        }
        for data in held {
            if let Err(e) = self.handle_binary(session, ws_sender, &data).await {
                log::warn!("Send to {} failed: {e}", session.connection_id);
                return SessionEnd::Disconnected;
            }
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = self.handle_binary(session, ws_sender, &data).await {
                            log::warn!("Send to {} failed: {e}", session.connection_id);
                            return SessionEnd::Disconnected;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {} closed", session.connection_id);
                        return SessionEnd::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {}: {e}", session.connection_id);
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {}
                },

                frame = broadcast_rx.recv() => match frame {
                    Ok(frame) => {
                        // Don't echo back to sender
                        if frame.origin == session.connection_id {
                            continue;
                        }
                        if ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {} lagged by {n} messages", session.connection_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => return SessionEnd::Disconnected,
                },

                _ = shutdown.changed() => {
                    close_with(ws_sender, SHUTDOWN_CLOSE_CODE, SHUTDOWN_REASON).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Process one inbound binary frame of an admitted session.
    async fn handle_binary(
        &self,
        session: &mut Session,
        ws_sender: &mut WsSender,
        bytes: &[u8],
    ) -> Result<(), axum::Error> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", session.connection_id);
                return Ok(());
            }
        };

        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        match msg.msg_type {
            MessageType::PeerJoined => {
                let info = msg
                    .peer_info()
                    .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));
                session.peer_id = info.peer_id;
                session.broadcast.update_peer(&session.connection_id, info.clone()).await;
                session.broadcast.broadcast_raw(session.connection_id, Arc::new(bytes.to_vec()));
                log::info!(
                    "Peer {} ({}) joined document '{}'",
                    info.name,
                    info.peer_id,
                    session.document
                );
            }

            MessageType::Delta => {
                if self.apply_update(&session.document, &msg.payload).await {
                    session.broadcast.broadcast_raw(session.connection_id, Arc::new(bytes.to_vec()));
                }
            }

            MessageType::SyncStep1 => {
                if let Some(diff) = self.diff_since(&session.document, &msg.payload).await {
                    send(ws_sender, &SyncMessage::sync_step2(Uuid::nil(), diff)).await?;
                }
            }

            MessageType::Awareness => {
                log::trace!("Awareness update in document '{}'", session.document);
                session.broadcast.broadcast_raw(session.connection_id, Arc::new(bytes.to_vec()));
            }

            MessageType::Ping => {
                send(ws_sender, &SyncMessage::pong(session.peer_id)).await?;
            }

            _ => {
                log::debug!("Unhandled message type: {:?}", msg.msg_type);
            }
        }
        Ok(())
    }

    /// Apply a Yrs update to a document. Only applied updates are relayed.
    async fn apply_update(&self, document: &str, payload: &[u8]) -> bool {
        let documents = self.documents.read().await;
        let Some(room) = documents.get(document) else { return false };
        let update = match yrs::Update::decode_v1(payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Discarding undecodable update for document '{document}': {e}");
                return false;
            }
        };
        let mut txn = yrs::Transact::transact_mut(&room.doc);
        match txn.apply_update(update) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to apply update to document '{document}': {e}");
                false
            }
        }
    }

    async fn diff_since(&self, document: &str, state_vector: &[u8]) -> Option<Vec<u8>> {
        let documents = self.documents.read().await;
        let room = documents.get(document)?;
        let remote_sv = yrs::StateVector::decode_v1(state_vector).ok()?;
        let txn = yrs::Transact::transact(&room.doc);
        Some(txn.encode_diff_v1(&remote_sv))
    }

    /// Join a connection to its document, creating the document if needed.
    async fn open(
        &self,
        document: String,
        connection_id: Uuid,
    ) -> (Session, broadcast::Receiver<Frame>, Vec<u8>) {
        let mut documents = self.documents.write().await;
        let is_new = !documents.contains_key(&document);
        let room = documents
            .entry(document.clone())
            .or_insert_with(|| DocumentRoom::new(self.config.broadcast_capacity));

        let rx = room
            .broadcast
            .add_peer(connection_id, PeerInfo::with_id(connection_id, "Anonymous"))
            .await;

        // Scope the transaction so it's dropped before await
        let state = {
            let txn = yrs::Transact::transact(&room.doc);
            txn.encode_state_as_update_v1(&yrs::StateVector::default())
        };
        let broadcast = room.broadcast.clone();
        let open = documents.len();
        drop(documents);

        if is_new {
            log::info!("Opened document '{document}'");
        }
        self.stats.write().await.open_documents = open;

        let session = Session {
            connection_id,
            peer_id: connection_id,
            document,
            broadcast,
        };
        (session, rx, state)
    }

    /// Remove a connection from its document; drop the document once empty.
    async fn leave(&self, session: &Session) {
        let mut documents = self.documents.write().await;
        if let Some(room) = documents.get(&session.document) {
            room.broadcast.remove_peer(&session.connection_id).await;

            let leave_msg = SyncMessage::peer_left(session.peer_id);
            let _ = room.broadcast.broadcast(session.connection_id, &leave_msg);

            if room.broadcast.peer_count().await == 0 {
                documents.remove(&session.document);
                log::info!("Document '{}' closed (no peers)", session.document);
            }
        }
        let open = documents.len();
        drop(documents);
        self.stats.write().await.open_documents = open;
    }
}

async fn send(ws_sender: &mut WsSender, msg: &SyncMessage) -> Result<(), axum::Error> {
    let encoded = match msg.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            log::error!("Failed to encode {:?}: {e}", msg.msg_type);
            return Ok(());
        }
    };
    ws_sender.send(Message::Binary(encoded.into())).await
}

async fn close_with(ws_sender: &mut WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        log::debug!("Close frame ({code}) not delivered: {e}");
    }
}
