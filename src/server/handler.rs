// Axum request handlers: control endpoint, push-event endpoint and session listing.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::publisher::sse_response;
use crate::api::gateway::{ControlGateway, ControlOutcome, ControlRequest, RejectReason};
use crate::engine::state::ControlAction;
use crate::worker::traits::DownloadKey;

pub struct DownloadServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DownloadServer {
    /// Bind `addr` (port 0 picks a free port) and serve in the background.
    pub async fn start(gateway: ControlGateway, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(gateway);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                warn!("download server stopped with error: {}", e);
            }
        });
        info!("download server listening on {}", addr);

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Absolute URL for a path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!("download server task failed: {}", e);
        }
    }
}

pub fn router(gateway: ControlGateway) -> Router {
    Router::new()
        .route("/download", get(events_handler).post(control_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(gateway)
}

#[derive(Debug, Deserialize)]
struct ControlBody {
    filename: Option<String>,
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    filename: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_key(filename: Option<&str>) -> Result<DownloadKey, Response> {
    let filename = filename.unwrap_or_default();
    DownloadKey::parse(filename).map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

/// POST /download: start/pause/resume/cancel a download.
async fn control_handler(
    State(gateway): State<ControlGateway>,
    body: Result<Json<ControlBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!("control request rejected: {}", rejection);
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    let key = match parse_key(body.filename.as_deref()) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let Some(action) = body.action.as_deref().and_then(ControlAction::parse) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid action");
    };

    let outcome = gateway.handle(ControlRequest { key, action }).await;
    outcome_response(outcome)
}

fn outcome_response(outcome: ControlOutcome) -> Response {
    match outcome {
        ControlOutcome::Accepted { message } => {
            (StatusCode::OK, Json(json!({ "message": message }))).into_response()
        }
        ControlOutcome::AlreadyActive { message } => error_response(StatusCode::CONFLICT, message),
        ControlOutcome::NoSuchSession { message } => error_response(StatusCode::NOT_FOUND, message),
        ControlOutcome::Rejected { reason, message } => {
            let status = match reason {
                RejectReason::UnsupportedAction => StatusCode::NOT_IMPLEMENTED,
                RejectReason::InvalidTransition => StatusCode::CONFLICT,
                RejectReason::SpawnFailed | RejectReason::WorkerFailure => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(json!({ "error": message, "reason": reason }))).into_response()
        }
    }
}

/// GET /download?filename=: push the session's events until its terminal event.
async fn events_handler(
    State(gateway): State<ControlGateway>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let key = match parse_key(query.filename.as_deref()) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match gateway.registry().subscribe(&key) {
        Ok(subscription) => {
            debug!("event stream opened for {}", key);
            sse_response(subscription).into_response()
        }
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// GET /sessions: snapshots of every live session.
async fn sessions_handler(State(gateway): State<ControlGateway>) -> Response {
    Json(gateway.registry().snapshots()).into_response()
}
