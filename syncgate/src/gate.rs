//! Connection admission: credential check and room derivation.
//!
//! The decision is deferred. [`AdmissionGate::admit`] returns a
//! [`PendingAdmission`] straight away and validation completes on its own
//! task, so the hand-off to the engine never waits on it. The engine must
//! hold every inbound frame until the pending admission resolves.

use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::{CredentialChannel, API_KEY_HEADER};
use crate::credential::Credential;
use crate::registry::RoomId;

/// Close code sent to connections whose credential is rejected.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;
pub const UNAUTHORIZED_REASON: &str = "Unauthorized";

/// Close code sent when authorization does not resolve in time.
pub const AUTH_TIMEOUT_CLOSE_CODE: u16 = 4008;
pub const AUTH_TIMEOUT_REASON: &str = "Authorization timeout";

/// Authorization state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Pending,
    Granted,
    Denied,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub accept: bool,
    pub room: Option<RoomId>,
}

/// `?apiKey=` as sent by browsers and by `/rooms` callers.
#[derive(Debug, Default, Deserialize)]
pub struct CredentialParams {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
}

impl CredentialParams {
    /// Read the `apiKey` parameter from a request URI.
    ///
    /// A malformed query string counts as no credential.
    pub fn from_uri(uri: &Uri) -> Self {
        Query::<Self>::try_from_uri(uri)
            .map(|Query(params)| params)
            .unwrap_or_default()
    }
}

/// The parts of an upgrade request the gate looks at.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    uri: Uri,
    headers: HeaderMap,
}

impl ConnectionRequest {
    pub fn new(uri: Uri, headers: HeaderMap) -> Self {
        Self { uri, headers }
    }

    /// The room this request targets, if any.
    pub fn room(&self) -> Option<RoomId> {
        RoomId::from_path(self.uri.path())
    }

    fn header_credential(&self) -> Option<String> {
        self.headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn query_credential(&self) -> Option<String> {
        CredentialParams::from_uri(&self.uri).api_key
    }
}

/// Decides whether a connection may reach the sync engine.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    credential: Credential,
    channel: CredentialChannel,
}

impl AdmissionGate {
    pub fn new(credential: Credential, channel: CredentialChannel) -> Self {
        Self { credential, channel }
    }

    pub fn channel(&self) -> CredentialChannel {
        self.channel
    }

    /// The credential presented on the configured channel only.
    fn presented(&self, request: &ConnectionRequest) -> Option<String> {
        match self.channel {
            CredentialChannel::Header => request.header_credential(),
            CredentialChannel::Query => request.query_credential(),
        }
    }

    /// Evaluate a request synchronously.
    pub fn decide(&self, request: &ConnectionRequest) -> AdmissionDecision {
        AdmissionDecision {
            accept: self.credential.validate(self.presented(request).as_deref()),
            room: request.room(),
        }
    }

    /// Start admission for a request and return the deferred decision.
    ///
    /// Must be called within a tokio runtime.
    pub fn admit(&self, request: ConnectionRequest) -> PendingAdmission {
        let room = request.room();
        let (tx, rx) = watch::channel(Authorization::Pending);
        let gate = self.clone();

        tokio::spawn(async move {
            let decision = gate.decide(&request);
            let room = decision.room.as_ref().map_or("<none>", RoomId::as_str);
            let outcome = if decision.accept {
                log::info!("Client authenticated for room {room}");
                Authorization::Granted
            } else {
                log::warn!("Authentication failed for room {room}");
                Authorization::Denied
            };
            // Nobody waiting means the connection is already gone.
            let _ = tx.send(outcome);
        });

        PendingAdmission { room, rx }
    }
}

/// A connection's admission decision, possibly still unresolved.
///
/// Clones observe the same decision.
#[derive(Debug, Clone)]
pub struct PendingAdmission {
    room: Option<RoomId>,
    rx: watch::Receiver<Authorization>,
}

impl PendingAdmission {
    /// An admission that is already decided.
    pub fn resolved(room: Option<RoomId>, authorization: Authorization) -> Self {
        let (_, rx) = watch::channel(authorization);
        Self { room, rx }
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    /// The current state without waiting.
    pub fn current(&self) -> Authorization {
        *self.rx.borrow()
    }

    /// Wait for the decision.
    ///
    /// If the deciding task disappears without answering, the connection is
    /// rejected.
    pub async fn decision(&mut self) -> AdmissionDecision {
        let accept = match self.rx.wait_for(|a| *a != Authorization::Pending).await {
            Ok(authorization) => *authorization == Authorization::Granted,
            Err(_) => false,
        };
        AdmissionDecision {
            accept,
            room: self.room.clone(),
        }
    }
}
