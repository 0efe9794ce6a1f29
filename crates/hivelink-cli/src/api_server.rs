use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use colored::Colorize;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use hivelink_core::logging::log;
use hivelink_core::now_millis;
use hivelink_queue::store::{NewMessage, NewResponse, QueuedResponse, StoreError};
use hivelink_queue::QueueRuntime;

use crate::random_suffix;

/// Shared state for the HTTP API.
pub struct ApiState {
    pub runtime: Arc<QueueRuntime>,
    pub events_tx: broadcast::Sender<String>,
}

fn response_json(response: &QueuedResponse, include_id: bool) -> serde_json::Value {
    let mut value = serde_json::json!({
        "channel": response.channel,
        "sender": response.sender,
        "senderId": response.sender_id,
        "message": response.body,
        "originalMessage": response.original_body,
        "timestamp": response.created_at,
        "messageId": response.message_id,
        "agent": response.agent,
    });
    let obj = value.as_object_mut().unwrap();
    if !response.files.is_empty() {
        obj.insert("files".to_string(), serde_json::json!(response.files));
    }
    if include_id {
        obj.insert("id".to_string(), serde_json::json!(response.id));
        if let Some(ref metadata) = response.metadata {
            obj.insert("metadata".to_string(), metadata.clone());
        }
    }
    value
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

// ─── Queue status ───────────────────────────────────────────────────────────

async fn queue_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.runtime.store.snapshot() {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "incoming": snapshot.pending,
                "processing": snapshot.processing,
                "outgoing": snapshot.pending_responses,
                "dead": snapshot.dead,
                "activeConversations": state.runtime.conversations.count(),
            })),
        ),
        Err(e) => internal_error(e),
    }
}

// ─── Responses ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<i64>,
}

async fn recent_responses(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.runtime.store.recent_responses(limit) {
        Ok(responses) => (
            StatusCode::OK,
            Json(serde_json::json!(responses
                .iter()
                .map(|r| response_json(r, false))
                .collect::<Vec<_>>())),
        ),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct PendingQuery {
    channel: Option<String>,
}

async fn pending_responses(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PendingQuery>,
) -> impl IntoResponse {
    let Some(channel) = query.channel else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Missing 'channel' query parameter" })),
        );
    };
    match state.runtime.store.pending_responses(&channel) {
        Ok(responses) => (
            StatusCode::OK,
            Json(serde_json::json!(responses
                .iter()
                .map(|r| response_json(r, true))
                .collect::<Vec<_>>())),
        ),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct ProactiveResponseRequest {
    channel: Option<String>,
    sender: Option<String>,
    #[serde(rename = "senderId")]
    sender_id: Option<String>,
    message: Option<String>,
    agent: Option<String>,
    files: Option<Vec<String>>,
}

async fn post_response(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ProactiveResponseRequest>,
) -> impl IntoResponse {
    let (Some(channel), Some(sender), Some(message)) =
        (body.channel, body.sender, body.message)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "channel, sender, and message are required" })),
        );
    };

    let message_id = format!("proactive-{}-{}", now_millis(), random_suffix(6));
    match state.runtime.store.enqueue_response(&NewResponse {
        message_id: message_id.clone(),
        channel,
        sender,
        sender_id: body.sender_id,
        body: message,
        original_body: String::new(),
        agent: body.agent,
        files: body.files.unwrap_or_default(),
        metadata: None,
    }) {
        Ok(id) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "id": id, "messageId": message_id })),
        ),
        Err(e) => internal_error(e),
    }
}

async fn ack_response(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.runtime.store.ack_response(id) {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))),
        Err(StoreError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No such response" })),
        ),
        Err(e) => internal_error(e),
    }
}

// ─── Dead letter ────────────────────────────────────────────────────────────

async fn dead_messages(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.runtime.store.dead_messages() {
        Ok(messages) => (
            StatusCode::OK,
            Json(serde_json::json!(messages
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "id": m.id,
                        "messageId": m.message_id,
                        "channel": m.channel,
                        "sender": m.sender,
                        "message": m.body,
                        "agent": m.target_agent,
                        "retryCount": m.retry_count,
                        "lastError": m.last_error,
                        "createdAt": m.created_at,
                        "updatedAt": m.updated_at,
                    })
                })
                .collect::<Vec<_>>())),
        ),
        Err(e) => internal_error(e),
    }
}

async fn retry_dead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.runtime.store.retry_dead(id) {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No dead message with that id" })),
        ),
        Err(e) => internal_error(e),
    }
}

async fn delete_dead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.runtime.store.delete_dead(id) {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No dead message with that id" })),
        ),
        Err(e) => internal_error(e),
    }
}

// ─── Adapter enqueue ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EnqueueRequest {
    channel: Option<String>,
    sender: Option<String>,
    #[serde(rename = "senderId")]
    sender_id: Option<String>,
    message: Option<String>,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    agent: Option<String>,
    files: Option<Vec<String>>,
}

async fn post_message(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<EnqueueRequest>,
) -> impl IntoResponse {
    let (Some(channel), Some(sender), Some(message), Some(message_id)) =
        (body.channel, body.sender, body.message, body.message_id)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "channel, sender, message, and messageId are required"
            })),
        );
    };

    // Adapters reference uploads inline so the agent sees the paths
    let files = body.files.unwrap_or_default();
    let message = if files.is_empty() {
        message
    } else {
        let refs = files
            .iter()
            .map(|f| format!("[file: {}]", f))
            .collect::<Vec<_>>()
            .join("\n");
        if message.is_empty() {
            refs
        } else {
            format!("{}\n\n{}", message, refs)
        }
    };

    let result = state.runtime.store.enqueue_message(&NewMessage {
        message_id: message_id.clone(),
        channel: channel.clone(),
        sender: sender.clone(),
        sender_id: body.sender_id,
        body: message,
        target_agent: body.agent,
        files,
        conversation_id: None,
        from_agent: None,
    });

    match result {
        Ok(id) => {
            state.runtime.bus.emit(
                "message_enqueued",
                serde_json::json!({
                    "channel": channel,
                    "sender": sender,
                    "messageId": message_id,
                }),
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({ "ok": true, "id": id })),
            )
        }
        Err(StoreError::DuplicateId(dup)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("Duplicate message id: {}", dup) })),
        ),
        Err(e) => internal_error(e),
    }
}

// ─── Event stream ───────────────────────────────────────────────────────────

async fn event_stream(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.events_tx.subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| msg.ok())
        .map(|data| Ok::<_, Infallible>(SseEvent::default().data(data)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ─── Public API ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queue/status", get(queue_status))
        .route("/api/queue/dead", get(dead_messages))
        .route("/api/queue/dead/{id}/retry", post(retry_dead))
        .route("/api/queue/dead/{id}", delete(delete_dead))
        .route("/api/responses", get(recent_responses).post(post_response))
        .route("/api/responses/pending", get(pending_responses))
        .route("/api/responses/{id}/ack", post(ack_response))
        .route("/api/messages", post(post_message))
        .route("/api/events", get(event_stream))
        .layer(cors)
        .with_state(state)
}

/// Serve the HTTP API. Blocks until the listener fails.
pub async fn serve(
    runtime: Arc<QueueRuntime>,
    events_tx: broadcast::Sender<String>,
    port: u16,
) -> Result<()> {
    let log_file = runtime.paths.log_file.clone();
    let state = Arc::new(ApiState { runtime, events_tx });
    let app = router(state);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    println!(
        "{}",
        format!("API server running at http://localhost:{}", port)
            .green()
            .bold()
    );
    log(
        "INFO",
        &format!("API server listening on {}", bind_addr),
        &log_file,
    );

    axum::serve(listener, app).await?;
    Ok(())
}
