//! HTTP/WebSocket front door.
//!
//! Routing:
//! ```text
//! any path + WebSocket upgrade ──► AdmissionGate ──► LifecycleTracker ──► SyncEngine
//! GET /rooms?apiKey=…          ──► AdminHandler (JSON)
//! OPTIONS /rooms               ──► 200, empty body
//! anything else                ──► 200, informational text
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::admin::{self, AdminHandler};
use crate::config::{GateConfig, API_KEY_HEADER};
use crate::credential::Credential;
use crate::engine::{EngineConfig, SyncEngine};
use crate::error::GateError;
use crate::gate::{AdmissionGate, ConnectionRequest, CredentialParams};
use crate::lifecycle::LifecycleTracker;
use crate::reconcile::Reconciler;
use crate::registry::RoomRegistry;

const INFO_TEXT: &str = "Sync gateway: open a WebSocket on /<room> to collaborate.\n";

/// Longest shutdown waits for live sessions to send their close frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    gate: AdmissionGate,
    tracker: LifecycleTracker,
    admin: AdminHandler,
}

/// The gateway server.
pub struct GateServer {
    config: GateConfig,
    registry: Arc<RoomRegistry>,
    engine: Arc<SyncEngine>,
    state: AppState,
}

impl GateServer {
    pub fn new(config: GateConfig) -> Self {
        let credential = Credential::new(config.api_key.clone());
        let registry = Arc::new(RoomRegistry::new());
        let engine = Arc::new(SyncEngine::new(EngineConfig {
            broadcast_capacity: config.broadcast_capacity,
            auth_timeout: config.auth_timeout,
            pending_message_limit: config.pending_message_limit,
        }));

        let state = AppState {
            gate: AdmissionGate::new(credential.clone(), config.credential_channel),
            tracker: LifecycleTracker::new(registry.clone(), engine.clone()),
            admin: AdminHandler::new(
                credential,
                registry.clone(),
                engine.clone(),
                config.reconcile_on_query,
            ),
        };

        Self {
            config,
            registry,
            engine,
            state,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)]);

        Router::new()
            .route("/rooms", get(rooms_or_socket).options(admin::preflight))
            .fallback(socket_or_info)
            .with_state(self.state.clone())
            .layer(cors)
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<(), GateError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an existing listener until `shutdown` completes.
    ///
    /// On shutdown the engine is closed first, so live sessions get a close
    /// frame. Returns once the listener and every session have finished, or
    /// after [`DRAIN_TIMEOUT`].
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GateError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        log::info!("Sync gateway is running on {addr}");

        let reconcile_task = self.config.reconcile_interval.map(|every| {
            let reconciler = Reconciler::new(self.registry.clone());
            tokio::spawn(reconciler.run_periodic(self.engine.clone(), every))
        });

        let engine = self.engine.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                log::info!("Shutdown signal received");
                engine.close();
            })
            .await?;

        // Upgraded sockets outlive axum's graceful shutdown.
        let live = self.engine.live_sessions();
        if live > 0 {
            log::info!("Waiting for {live} session(s) to close");
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.engine.drained()).await.is_err() {
            log::warn!(
                "{} session(s) still open after {DRAIN_TIMEOUT:?}",
                self.engine.live_sessions()
            );
        }

        if let Some(task) = reconcile_task {
            task.abort();
        }
        log::info!("Sync gateway stopped");
        Ok(())
    }
}

/// `/rooms`: an upgrade is a sync connection to room "rooms", anything else
/// is an admin query.
async fn rooms_or_socket(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match ws {
        Ok(ws) => upgrade(ws, state, uri, headers),
        Err(_) => {
            let params = CredentialParams::from_uri(&uri);
            match state.admin.rooms_query(params.api_key.as_deref()).await {
                Ok(rooms) => rooms.into_response(),
                Err(unauthorized) => unauthorized.into_response(),
            }
        }
    }
}

async fn socket_or_info(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match ws {
        Ok(ws) => upgrade(ws, state, uri, headers),
        Err(_) => (StatusCode::OK, INFO_TEXT).into_response(),
    }
}

/// Start admission and hand the upgraded socket to the tracker.
///
/// The upgrade completes before the decision is known. A rejected
/// connection is closed by the engine with 4001.
fn upgrade(ws: WebSocketUpgrade, state: AppState, uri: Uri, headers: HeaderMap) -> Response {
    let admission = state.gate.admit(ConnectionRequest::new(uri, headers));
    let tracker = state.tracker;
    ws.on_upgrade(move |socket| async move {
        tracker.track(socket, admission).await;
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoomId;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn server() -> GateServer {
        GateServer::new(GateConfig::new("secret"))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_rooms_with_valid_key() {
        let server = server();
        let registry = server.registry().clone();
        registry.increment(&RoomId::new("doc-a").unwrap());
        registry.increment(&RoomId::new("doc-a").unwrap());
        registry.increment(&RoomId::new("doc-c").unwrap());

        let response = server
            .router()
            .oneshot(Request::get("/rooms?apiKey=secret").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            r#"{"rooms":[{"name":"doc-a","connections":2},{"name":"doc-c","connections":1}]}"#
        );
    }

    #[tokio::test]
    async fn test_rooms_with_wrong_key() {
        let server = server();
        server.registry().increment(&RoomId::new("doc-a").unwrap());

        let response = server
            .router()
            .oneshot(Request::get("/rooms?apiKey=nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, r#"{"error":"Unauthorized"}"#);
    }

    #[tokio::test]
    async fn test_rooms_without_key() {
        let response = server()
            .router()
            .oneshot(Request::get("/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rooms_ignores_header_credential() {
        let response = server()
            .router()
            .oneshot(
                Request::get("/rooms")
                    .header(API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rooms_cors_headers() {
        let response = server()
            .router()
            .oneshot(
                Request::get("/rooms?apiKey=secret")
                    .header(header::ORIGIN, "https://admin.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/rooms")
                    .header(header::ORIGIN, "https://admin.example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_bare_options() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/rooms")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_plain_request_gets_info_text() {
        let response = server()
            .router()
            .oneshot(Request::get("/doc-a").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, INFO_TEXT);
    }

    #[tokio::test]
    async fn test_server_wires_config() {
        let mut config = GateConfig::new("secret");
        config.broadcast_capacity = 8;
        config.pending_message_limit = 3;
        let server = GateServer::new(config);
        assert_eq!(server.engine().config().broadcast_capacity, 8);
        assert_eq!(server.engine().config().pending_message_limit, 3);
        assert_eq!(server.config().port, 1234);
    }
}
