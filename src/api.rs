//! REST + WebSocket API server
//!
//! Routes chat turns from session channels to the agent and exposes the
//! completion provider and the scan scheduler over HTTP.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::agent::AgentInvoker;
use crate::models::{ChatMessage, InboundEvent, Sender};
use crate::persistence::MessageSink;
use crate::provider::CompletionService;
use crate::retry::RetryPolicy;
use crate::scheduler::{ScanReport, ScanScheduler};

/// Earlier turns replayed to the agent with each new turn
const HISTORY_WINDOW: usize = 10;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub completions: Arc<CompletionService>,
    pub agent: Arc<dyn AgentInvoker>,
    /// `None` when no wallet is configured
    pub scheduler: Option<Arc<ScanScheduler>>,
    pub sink: Arc<dyn MessageSink>,
    pub retry_policy: RetryPolicy,
}

/// =============================
/// Helpers: Session Keys
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

/// Storage key for a client-supplied session id. Wallet addresses and other
/// free-form ids map to a stable UUID; a missing id gets a fresh one.
fn session_key(value: Option<&str>) -> uuid::Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            uuid::Uuid::parse_str(v.trim()).unwrap_or_else(|_| stable_uuid_from_string(v.trim()))
        }
        _ => uuid::Uuid::new_v4(),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Completion Endpoint
/// =============================

async fn completion_handler(
    State(state): State<ApiState>,
    Json(req): Json<CompletionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Prompt must not be empty".into())),
        );
    }

    match state
        .completions
        .generate_completion_with_retry(&req.prompt, &state.retry_policy)
        .await
    {
        Ok(completion) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "provider": state.completions.provider(),
                "completion": completion,
            }))),
        ),
        Err(e) => {
            error!("Completion failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error(format!("Completion failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Scan Endpoint
/// =============================

async fn scan_handler(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    let Some(scheduler) = state.scheduler.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("Scan scheduler is not configured".into())),
        );
    };

    match scheduler.run_scan().await {
        ScanReport::Completed(outcome) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "completed",
                "outcome": outcome,
            }))),
        ),
        ScanReport::Skipped(reason) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "skipped",
                "reason": format!("{:?}", reason),
            }))),
        ),
        ScanReport::Failed(e) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "failed",
                "error": e.to_string(),
            }))),
        ),
    }
}

/// =============================
/// Transcript Endpoint
/// =============================

async fn messages_handler(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let key = session_key(Some(&session_id));

    match state.sink.history(&key.to_string()).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "session_id": key,
                "messages": messages,
            }))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to load messages: {}", e))),
        ),
    }
}

/// =============================
/// Session WebSocket
/// =============================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(params): Query<SessionParams>,
) -> Response {
    let key = session_key(params.session_id.as_deref());
    ws.on_upgrade(move |socket| handle_session(socket, state, key.to_string()))
}

async fn handle_session(mut socket: WebSocket, state: ApiState, session_id: String) {
    info!(%session_id, "Session connected");

    // Turns are answered one at a time so replies keep the order of questions.
    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(%session_id, "Session socket error: {}", e);
                break;
            }
        };

        if text.trim().is_empty() {
            debug!(%session_id, "Ignoring empty turn");
            continue;
        }

        let history = match state.sink.history(&session_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(%session_id, "Transcript load failed, continuing without context: {}", e);
                Vec::new()
            }
        };
        let prompt = conversation_prompt(&history, &text);

        persist(&state, &session_id, ChatMessage::user(text.as_str())).await;

        let event = match state.agent.invoke(&prompt).await {
            Ok(outcome) => {
                persist(&state, &session_id, ChatMessage::agent(outcome.output.as_str())).await;
                InboundEvent::agent_response(outcome.output)
            }
            Err(e) => {
                error!(%session_id, "Agent turn failed: {}", e);
                InboundEvent::agent_error(e.to_string())
            }
        };

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%session_id, "Failed to encode session event: {}", e);
                continue;
            }
        };

        if socket.send(Message::Text(payload)).await.is_err() {
            debug!(%session_id, "Session closed before reply was delivered");
            break;
        }
    }

    info!(%session_id, "Session disconnected");
}

/// Prefix `turn` with the most recent earlier turns of the session.
fn conversation_prompt(history: &[ChatMessage], turn: &str) -> String {
    if history.is_empty() {
        return turn.to_string();
    }

    let recent = &history[history.len().saturating_sub(HISTORY_WINDOW)..];
    let mut prompt = String::from("Based on our conversation history:\n\n");
    for message in recent {
        let speaker = match message.sender {
            Sender::User => "User",
            Sender::Agent => "Agent",
        };
        prompt.push_str(&format!("- {}: {}\n", speaker, message.text));
    }
    prompt.push_str("\n---\n\n");
    prompt.push_str(turn);
    prompt
}

async fn persist(state: &ApiState, session_id: &str, message: ChatMessage) {
    if let Err(e) = state.sink.append(session_id, &message).await {
        warn!(%session_id, "Failed to persist chat message: {}", e);
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/completion", post(completion_handler))
        .route("/api/scan", post(scan_handler))
        .route("/api/messages/:session_id", get(messages_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
