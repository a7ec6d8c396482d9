//! WebSocket client for the gateway.
//!
//! Provides:
//! - Connection to `ws://host/<room>` presenting the shared credential
//! - Delta, awareness and state-vector messages
//! - Events for everything the engine sends back, including the close
//!   frame of a rejected connection

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::config::{CredentialChannel, API_KEY_HEADER, API_KEY_PARAM};
use crate::error::ClientError;
use crate::protocol::{AwarenessState, MessageType, PeerInfo, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// WebSocket handshake completed. Admission may still be pending.
    Connected,
    /// Document state (or a diff) received from the server
    StateSynced(Vec<u8>),
    /// CRDT delta from a remote peer
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// Awareness update from a remote peer
    RemoteAwareness { peer_id: Uuid, state: AwarenessState },
    /// A peer announced itself
    PeerJoined(PeerInfo),
    /// A peer left the room
    PeerLeft(Uuid),
    /// Heartbeat answer
    Pong,
    /// Connection closed; `code` is None when no close frame arrived
    Closed { code: Option<u16>, reason: String },
}

/// The gateway client.
pub struct GateClient {
    peer_info: PeerInfo,
    room: String,
    server_url: String,
    api_key: String,
    channel: CredentialChannel,
    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock for causal ordering
    clock: Arc<RwLock<u64>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<GateEvent>>,
    event_tx: mpsc::Sender<GateEvent>,
}

impl GateClient {
    /// Create a client for `room` on `server_url` (e.g. `ws://127.0.0.1:1234`).
    pub fn new(
        peer_info: PeerInfo,
        room: impl Into<String>,
        server_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room: room.into(),
            server_url: server_url.into(),
            api_key: api_key.into(),
            channel: CredentialChannel::Header,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Present the credential on `channel` instead of the header.
    pub fn with_channel(mut self, channel: CredentialChannel) -> Self {
        self.channel = channel;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<GateEvent>> {
        self.event_rx.take()
    }

    /// The URL this client connects to.
    pub fn connection_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.server_url)?;
        url.set_path(&format!("/{}", self.room));
        if self.channel == CredentialChannel::Query {
            url.query_pairs_mut().append_pair(API_KEY_PARAM, &self.api_key);
        }
        Ok(url)
    }

    /// Connect to the gateway.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// announces this peer. A successful return only means the upgrade
    /// completed: a rejected credential shows up as
    /// `GateEvent::Closed { code: Some(4001), .. }`.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self.connection_url()?.as_str().into_client_request()?;
        if self.channel == CredentialChannel::Header {
            let value =
                HeaderValue::from_str(&self.api_key).map_err(|_| ClientError::InvalidCredential)?;
            request.headers_mut().insert(API_KEY_HEADER, value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let join = SyncMessage::peer_joined(&self.peer_info).encode()?;
        let _ = out_tx.send(Message::Binary(join.into())).await;
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(GateEvent::Connected).await;

        // Reader task: translate incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let own_peer_id = self.peer_info.peer_id;
        tokio::spawn(async move {
            let mut closed = GateEvent::Closed { code: None, reason: String::new() };
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let Ok(sync_msg) = SyncMessage::decode(&data) else { continue };
                        if sync_msg.peer_id == own_peer_id {
                            continue;
                        }
                        if let Some(event) = event_for(sync_msg) {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            closed = GateEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_string(),
                            };
                        }
                        break;
                    }
                    Err(e) => {
                        log::debug!("Client connection error: {e}");
                        break;
                    }
                    Ok(_) => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(closed).await;
        });

        Ok(())
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Send a CRDT delta.
    pub async fn send_delta(&self, yrs_update: Vec<u8>) -> Result<(), ClientError> {
        let clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };
        self.send(&SyncMessage::delta(self.peer_info.peer_id, clock, yrs_update))
            .await
    }

    /// Send an awareness update (cursor position, selection).
    pub async fn send_awareness(&self, awareness: &AwarenessState) -> Result<(), ClientError> {
        let clock = *self.clock.read().await;
        self.send(&SyncMessage::awareness(self.peer_info.peer_id, clock, awareness))
            .await
    }

    /// Ask for everything missing relative to `state_vector`.
    pub async fn request_diff(&self, state_vector: Vec<u8>) -> Result<(), ClientError> {
        self.send(&SyncMessage::sync_step1(self.peer_info.peer_id, state_vector))
            .await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(&SyncMessage::ping(self.peer_info.peer_id)).await
    }

    /// Close the connection with a normal close frame.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }
}

fn event_for(msg: SyncMessage) -> Option<GateEvent> {
    match msg.msg_type {
        MessageType::Delta => Some(GateEvent::RemoteDelta {
            peer_id: msg.peer_id,
            clock: msg.clock,
            update: msg.payload,
        }),
        MessageType::SyncStep2 => Some(GateEvent::StateSynced(msg.payload)),
        MessageType::Awareness => msg.awareness_state().ok().map(|state| GateEvent::RemoteAwareness {
            peer_id: msg.peer_id,
            state,
        }),
        MessageType::PeerJoined => msg.peer_info().ok().map(GateEvent::PeerJoined),
        MessageType::PeerLeft => Some(GateEvent::PeerLeft(msg.peer_id)),
        MessageType::Pong => Some(GateEvent::Pong),
        MessageType::SyncStep1 | MessageType::Ping => None,
    }
}
