//! Error types for the gateway.
//!
//! Each concern gets its own enum so callers can tell a fatal startup
//! problem apart from a per-connection failure.

use thiserror::Error;

/// Startup configuration errors. Always fatal: the process exits before
/// binding a listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Errors raised while running the gateway server.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}

/// Errors surfaced by [`crate::client::GateClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Invalid credential value")]
    InvalidCredential,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Not connected")]
    NotConnected,
}
