//! # syncgate: Authenticated WebSocket gateway for CRDT rooms
//!
//! Admits WebSocket connections that present a shared API key, hands them
//! to a room-based Yrs sync engine, and keeps a live count of connections
//! per room for an administrative query endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ws://host/<room>  ┌───────────────┐  admitted  ┌─────────────┐
//! │ GateClient  │ ──────────────────► │ AdmissionGate │ ─────────► │ SyncEngine  │
//! │ (per user)  │ ◄────────────────── │ (deferred)    │            │ Yrs Doc per │
//! └─────────────┘  4001 on reject    └───────────────┘            │ room        │
//!                                            │                     └──────┬──────┘
//!                                            ▼                            │ discovery
//! ┌─────────────┐  GET /rooms?apiKey  ┌───────────────┐  reconcile  ┌─────┴───────┐
//! │ Admin tool  │ ──────────────────► │ AdminHandler  │ ◄────────── │ Reconciler  │
//! └─────────────┘  {"rooms":[…]}     │ RoomRegistry  │             └─────────────┘
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Environment configuration (`API_KEY`, `PORT`, …)
//! - [`credential`]: Shared-secret validation
//! - [`registry`]: Ordered room → connection-count map
//! - [`reconcile`]: Insert-if-absent discovery from the engine
//! - [`gate`]: Deferred admission decisions
//! - [`lifecycle`]: Presence accounting per admitted connection
//! - [`engine`]: Room-based Yrs sync engine
//! - [`admin`]: `GET /rooms` handler
//! - [`server`]: axum router, CORS, graceful shutdown
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Per-document fan-out with backpressure
//! - [`client`]: WebSocket client

pub mod admin;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use admin::{AdminHandler, RoomsResponse, Unauthorized};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, GateClient, GateEvent};
pub use config::{CredentialChannel, GateConfig};
pub use credential::Credential;
pub use engine::{EngineConfig, EngineStats, SessionEnd, SyncEngine};
pub use error::{ClientError, ConfigError, GateError, ProtocolError};
pub use gate::{AdmissionDecision, AdmissionGate, ConnectionRequest, PendingAdmission};
pub use lifecycle::{LifecycleTracker, Presence};
pub use protocol::{AwarenessState, MessageType, PeerInfo, SyncMessage};
pub use reconcile::Reconciler;
pub use registry::{RoomId, RoomPresence, RoomRegistry};
pub use server::GateServer;
