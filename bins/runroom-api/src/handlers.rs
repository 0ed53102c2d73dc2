// HTTP and WebSocket handlers for the Runroom API

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use runroom_common::types::{ClientFrame, ServerFrame};
use runroom_core::{Admission, ConnectionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub session_id: String,
    pub language: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub job_id: Uuid,
    pub status: &'static str,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// POST /run - Queue code for execution; output arrives on the session room
pub async fn run_code(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            metrics::record_run("invalid");
            warn!(error = %rejection.body_text(), "Malformed run request");
            return error_body(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    if payload.session_id.trim().is_empty() {
        metrics::record_run("invalid");
        return error_body(StatusCode::BAD_REQUEST, "sessionId is required");
    }

    let session_id = payload.session_id.clone();
    match state
        .intake
        .handle_run_request(payload.code, payload.language, payload.session_id)
        .await
    {
        Ok(Admission::Accepted { job_id }) => {
            metrics::record_run("accepted");
            (
                StatusCode::ACCEPTED,
                Json(RunAccepted {
                    job_id,
                    status: "queued",
                }),
            )
                .into_response()
        }
        Ok(Admission::Rejected(rejection)) => {
            metrics::record_run("rejected");
            error_body(StatusCode::CONFLICT, rejection.to_string())
        }
        Err(e) => {
            metrics::record_run("error");
            error!(session_id = %session_id, error = %e, "Failed to queue run request");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to queue run request: {}", e),
            )
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn scrape_metrics() -> Response {
    match metrics::render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /ws - Realtime connection: join/leave rooms, publish, receive room events
pub async fn ws_connect(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: AppState, socket: WebSocket) {
    let (connection, mut outbound) = state.router.connect();
    metrics::OPEN_CONNECTIONS.inc();
    info!(connection_id = %connection, "Client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                let frame = match serde_json::to_string(&ServerFrame::from(envelope.as_ref())) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "Failed to encode server frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_text(&state, &connection, &text, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %connection, error = %e, "Socket error");
                        break;
                    }
                }
            }
        }
    }

    state.router.disconnect(&connection);
    metrics::OPEN_CONNECTIONS.dec();
    info!(connection_id = %connection, "Client disconnected");
}

/// Apply one client frame. Returns `false` once the socket can no longer be written.
async fn handle_client_text(
    state: &AppState,
    connection: &ConnectionId,
    text: &str,
    sender: &mut SplitSink<WebSocket, Message>,
) -> bool {
    let problem = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => match state.router.handle_frame(connection, frame).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(connection_id = %connection, error = %e, "Client frame refused");
                e.to_string()
            }
        },
        Err(e) => format!("Malformed frame: {}", e),
    };

    let reply = serde_json::json!({ "error": problem }).to_string();
    sender.send(Message::Text(reply)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runroom_core::{
        Bus, FanoutRouter, Intake, JobQueue, LanguageConfigManager, LocalBus, MemoryJobStore,
        QueueConfig, Runner,
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn state() -> AppState {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let router = FanoutRouter::start("test", bus, 16).await.unwrap();
        let runner = Runner::new(Arc::new(LanguageConfigManager::builtin()), "./codes");
        let queue = JobQueue::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(runner),
            router.clone(),
            QueueConfig::default(),
        );
        AppState {
            intake: Intake::new(queue),
            router,
            shutdown: CancellationToken::new(),
        }
    }

    fn request(session_id: &str) -> Result<Json<RunRequest>, JsonRejection> {
        Ok(Json(RunRequest {
            session_id: session_id.to_string(),
            language: "python".to_string(),
            code: "print(1)".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_run_accepted_then_conflict() {
        let state = state().await;

        let first = run_code(State(state.clone()), request("s1")).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = run_code(State(state), request("s1")).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_run_requires_session() {
        let state = state().await;
        let response = run_code(State(state), request("  ")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_run_request_wire_format() {
        let request: RunRequest =
            serde_json::from_str(r#"{"sessionId":"s1","language":"python"}"#).unwrap();
        assert_eq!(request.session_id, "s1");
        assert_eq!(request.code, "");
    }
}
