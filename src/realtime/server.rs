//! HTTP/WebSocket surface: `/pull`, `/capture` and `/health`

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{future, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::protocol::{PullMessage, PullRequest};
use super::session::{PullSession, SessionEnd};
use crate::classify::{Classifier, OperationDescriptor};
use crate::dispatch::Dispatcher;
use crate::storage::EventLog;
use crate::types::PullConfig;

/// Session identifier
pub type SessionId = String;

/// Bookkeeping for one connected pull client
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub group: Option<String>,
    pub consumer: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Connected pull sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionInfo>>>,
}

impl SessionRegistry {
    pub fn register(&self, id: SessionId, info: SessionInfo) {
        self.sessions.write().insert(id, info);
    }

    pub fn unregister(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).cloned()
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    log: Option<Arc<dyn EventLog>>,
    dispatcher: Dispatcher,
    classifier: Arc<Classifier>,
    pull: PullConfig,
    sessions: SessionRegistry,
    shutdown: watch::Receiver<bool>,
}

/// The relay's HTTP server
pub struct RelayServer {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// `log` is `None` in console mode; `/pull` then answers 503
    pub fn new(log: Option<Arc<dyn EventLog>>, dispatcher: Dispatcher, pull: PullConfig) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            state: AppState {
                log,
                dispatcher,
                classifier: Arc::new(Classifier::default()),
                pull,
                sessions: SessionRegistry::default(),
                shutdown,
            },
            shutdown_tx,
        }
    }

    /// Replace the route-table classifier used by `/capture`
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.state.classifier = Arc::new(classifier);
        self
    }

    pub fn sessions(&self) -> SessionRegistry {
        self.state.sessions.clone()
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/pull", get(pull_handler))
            .route("/capture", post(capture_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Ask every open pull session to close
    pub fn close_sessions(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Serve until `signal` resolves, then close the pull sessions and let
    /// in-flight requests finish
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        tracing::info!(addr = ?listener.local_addr().ok(), "relay server listening");

        let shutdown_tx = self.shutdown_tx;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!("shutdown requested, closing pull sessions");
                let _ = shutdown_tx.send(true);
            })
            .await
    }
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, engine, log_health) = match &state.log {
        None => ("ok", "console".to_string(), None),
        Some(log) => match log.health_check().await {
            Ok(health) if health.healthy => ("ok", log.engine().to_string(), Some(health.latency_ms)),
            Ok(_) | Err(_) => ("degraded", log.engine().to_string(), None),
        },
    };

    Json(json!({
        "status": status,
        "engine": engine,
        "log_latency_ms": log_health,
        "sessions": state.sessions.count(),
        "dispatch": state.dispatcher.stats(),
    }))
}

/// Classify a completed proxied operation and feed the dispatcher
async fn capture_handler(
    State(state): State<AppState>,
    Json(op): Json<OperationDescriptor>,
) -> Response {
    let events = state.classifier.classify(&op);
    match state.dispatcher.submit_all(events).await {
        Ok(count) => Json(json!({ "events": count })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "capture rejected");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade for a pull session
async fn pull_handler(
    ws: WebSocketUpgrade,
    Query(request): Query<PullRequest>,
    State(state): State<AppState>,
) -> Response {
    let Some(log) = state.log.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "no backend log configured",
        )
            .into_response();
    };

    let session_id = Uuid::new_v4().to_string();
    let session = match PullSession::new(log, state.pull.clone(), &request, &session_id) {
        Ok(session) => session,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, session, session_id, state))
}

/// Drive one pull session over a WebSocket
async fn handle_socket(socket: WebSocket, session: PullSession, session_id: SessionId, state: AppState) {
    let info = SessionInfo {
        group: session.group().map(|g| g.group.clone()),
        consumer: session.group().map(|g| g.consumer.clone()),
        connected_at: Utc::now(),
    };
    state.sessions.register(session_id.clone(), info);
    tracing::info!(session = %session_id, "pull session connected");

    let (mut sender, mut receiver) = socket.split();
    let mut shutdown = state.shutdown.clone();

    let outcome = {
        let mut frames = (&mut sender).with(|message: PullMessage| {
            future::ready(
                serde_json::to_string(&message)
                    .map(Message::Text)
                    .map_err(axum::Error::new),
            )
        });

        // inbound frames only matter for noticing the client leaving
        let client_gone = async {
            while let Some(Ok(message)) = receiver.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        };

        let stop_requested = async {
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    // server handle dropped without a shutdown
                    future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            result = session.run(&mut frames) => Some(result),
            _ = client_gone => None,
            _ = stop_requested => None,
        }
    };

    match outcome {
        Some(Err(e)) => {
            tracing::warn!(session = %session_id, error = %e, "pull session ended with error");
            let _ = sender.send(Message::Close(None)).await;
        }
        Some(Ok(SessionEnd::Disconnected)) | None => {
            let _ = sender.send(Message::Close(None)).await;
        }
    }

    state.sessions.unregister(&session_id);
    tracing::info!(session = %session_id, "pull session disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, ReadRequest};
    use crate::types::DispatchConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn server(log: Option<Arc<dyn EventLog>>) -> (RelayServer, Dispatcher) {
        let mut builder = Dispatcher::builder(DispatchConfig::default());
        if let Some(log) = &log {
            builder = builder.log(log.clone());
        }
        let dispatcher = builder.start().unwrap();
        (
            RelayServer::new(log, dispatcher.clone(), PullConfig::default()),
            dispatcher,
        )
    }

    #[test]
    fn test_session_registry() {
        let registry = SessionRegistry::default();
        registry.register(
            "s1".into(),
            SessionInfo {
                group: Some("g".into()),
                consumer: Some("c".into()),
                connected_at: Utc::now(),
            },
        );
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("s1").unwrap().group.as_deref(), Some("g"));
        registry.unregister("s1");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_capture_classifies_and_appends() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryBackend::new());
        let (server, dispatcher) = server(Some(log.clone()));

        let body = json!({
            "method": "MOVE",
            "path": "/dav/a/x.txt",
            "headers": {"Destination": "http://host/dav/b/x.txt"},
            "status": 201
        });
        let response = server
            .router()
            .oneshot(
                Request::post("/capture")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply, json!({"events": 1}));

        dispatcher.flush().await.unwrap();
        let entries = log.read(&ReadRequest::after(None, 10)).await.unwrap();
        assert_eq!(entries[0].event.payload["to_path"], json!("/b/x.txt"));
    }

    #[tokio::test]
    async fn test_failed_operation_captures_nothing() {
        let (server, _) = server(Some(Arc::new(MemoryBackend::new())));
        let body = json!({"method": "DELETE", "path": "/dav/a", "status": 404});
        let response = server
            .router()
            .oneshot(
                Request::post("/capture")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply, json!({"events": 0}));
    }

    #[tokio::test]
    async fn test_health_reports_engine() {
        let (server, _) = server(Some(Arc::new(MemoryBackend::new())));
        let response = server
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["status"], json!("ok"));
        assert_eq!(reply["engine"], json!("memory"));
        assert_eq!(reply["sessions"], json!(0));
    }

    #[tokio::test]
    async fn test_health_console_mode() {
        let (server, _) = server(None);
        let response = server
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["engine"], json!("console"));
    }
}
