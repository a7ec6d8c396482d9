//! `GET /rooms`: read-only view of the presence registry.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::credential::Credential;
use crate::engine::SyncEngine;
use crate::reconcile::Reconciler;
use crate::registry::{RoomPresence, RoomRegistry};

/// Body of a successful rooms query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomPresence>,
}

impl IntoResponse for RoomsResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Credential check failed. Renders as `401 {"error":"Unauthorized"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unauthorized;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl IntoResponse for Unauthorized {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: "Unauthorized" };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Answers administrative queries against the registry.
#[derive(Clone)]
pub struct AdminHandler {
    credential: Credential,
    registry: Arc<RoomRegistry>,
    reconciler: Reconciler,
    engine: Arc<SyncEngine>,
    reconcile_on_query: bool,
}

impl AdminHandler {
    pub fn new(
        credential: Credential,
        registry: Arc<RoomRegistry>,
        engine: Arc<SyncEngine>,
        reconcile_on_query: bool,
    ) -> Self {
        Self {
            credential,
            reconciler: Reconciler::new(registry.clone()),
            registry,
            engine,
            reconcile_on_query,
        }
    }

    /// Snapshot the registry for a caller presenting `presented`.
    ///
    /// An invalid credential gets [`Unauthorized`] and nothing else.
    pub async fn rooms_query(&self, presented: Option<&str>) -> Result<RoomsResponse, Unauthorized> {
        if !self.credential.validate(presented) {
            log::warn!("Rejected rooms query: invalid API key");
            return Err(Unauthorized);
        }
        if self.reconcile_on_query {
            self.reconciler.reconcile_engine(&self.engine).await;
        }
        Ok(RoomsResponse {
            rooms: self.registry.snapshot(),
        })
    }
}

/// Bare `OPTIONS /rooms`: 200 with an empty body. CORS preflights carrying
/// `Origin` are answered by the CORS layer before reaching here.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}
