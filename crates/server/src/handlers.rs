//! HTTP handlers
//!
//! The JSON API mirrors what the streaming UI and the CLI client
//! consume: conversation CRUD, chat/cancel, and an SSE stream per
//! conversation that joins at the caller's last-seen sequence id.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use confab_core::llm::Message;
use confab_core::slug;
use confab_core::stream::{
    agent_working, context_window_size, ApiMessage, ConversationListUpdate, StreamSnapshot,
};
use confab_core::CoreError;

use crate::coordinator::Coordinator;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Directories `/api/read` may serve files from.
    pub read_roots: Arc<Vec<PathBuf>>,
}

const DEFAULT_LIST_LIMIT: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    slug: String,
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

fn core_error_response(err: anyhow::Error) -> Response {
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::ConversationNotFound(_)) => {
            (StatusCode::NOT_FOUND, "Conversation not found").into_response()
        }
        Some(e @ CoreError::ModelMismatch { .. }) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Some(e @ CoreError::TurnInProgress(_)) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Some(e @ CoreError::SlugConflict(_)) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        _ => internal_error(err),
    }
}

// ============================================================================
// Conversation listing
// ============================================================================

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    list_impl(&state, params, false).await
}

pub async fn list_archived_conversations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    list_impl(&state, params, true).await
}

async fn list_impl(state: &AppState, params: ListParams, archived: bool) -> Response {
    let store = state.coordinator.store();
    let limit = params.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let query = params.q.unwrap_or_default();

    let result = match (archived, query.is_empty()) {
        (false, true) => store.list_conversations(limit, offset).await,
        (false, false) => store.search_conversations(&query, limit, offset).await,
        (true, true) => store.list_archived(limit, offset).await,
        (true, false) => store.search_archived(&query, limit, offset).await,
    };

    match result {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// Conversation snapshot and stream
// ============================================================================

async fn snapshot_response(state: &AppState, conversation_id: &str) -> Result<Response, Response> {
    let store = state.coordinator.store();
    let conversation = store
        .get_conversation(conversation_id)
        .await
        .map_err(|e| core_error_response(e.into()))?;
    let messages = store
        .list_messages(conversation_id)
        .await
        .map_err(|e| core_error_response(e.into()))?;

    let api: Vec<ApiMessage> = messages.into_iter().map(Into::into).collect();
    let snapshot = StreamSnapshot {
        agent_working: agent_working(&api),
        context_window_size: context_window_size(&api),
        messages: api,
        conversation: Some(conversation),
        conversation_list_update: None,
    };
    Ok(Json(snapshot).into_response())
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match snapshot_response(&state, &conversation_id).await {
        Ok(response) | Err(response) => response,
    }
}

pub async fn get_conversation_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Response {
    let conversation = match state.coordinator.store().get_conversation_by_slug(&slug).await {
        Ok(conversation) => conversation,
        Err(e) => return core_error_response(e.into()),
    };
    match snapshot_response(&state, &conversation.conversation_id).await {
        Ok(response) | Err(response) => response,
    }
}

pub async fn stream_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    let store = state.coordinator.store();
    let conversation = match store.get_conversation(&conversation_id).await {
        Ok(conversation) => conversation,
        Err(e) => return core_error_response(e.into()),
    };
    let messages = match store.list_messages(&conversation_id).await {
        Ok(messages) => messages,
        Err(e) => return internal_error(e),
    };

    let api: Vec<ApiMessage> = messages.into_iter().map(Into::into).collect();
    let last_sequence_id = api.last().map(|m| m.sequence_id).unwrap_or(-1);
    let initial = StreamSnapshot {
        agent_working: agent_working(&api),
        context_window_size: context_window_size(&api),
        messages: api,
        conversation: Some(conversation),
        conversation_list_update: None,
    };

    let manager = match state.coordinator.get_or_create_manager(&conversation_id).await {
        Ok(manager) => manager,
        Err(e) => return core_error_response(e),
    };

    // Subscribe to everything after the snapshot we are about to send.
    // Dropping the SSE stream drops the mailbox; the next publish then
    // reaps the subscriber.
    let token = CancellationToken::new();
    let subscription = manager.subpub().subscribe(&token, last_sequence_id);

    let first = futures::stream::iter(vec![sse_event(&initial)]);
    let rest = futures::stream::unfold(subscription, |mut subscription| async move {
        let snapshot = subscription.next().await?;
        Some((sse_event(&snapshot), subscription))
    });

    Sse::new(first.chain(rest).boxed())
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_event<T: serde::Serialize>(value: &T) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(value).unwrap_or_default()))
}

// ============================================================================
// Chat
// ============================================================================

pub async fn new_conversation(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.is_empty() {
        return (StatusCode::BAD_REQUEST, "Message is required").into_response();
    }

    let model_id = request
        .model
        .clone()
        .unwrap_or_else(|| state.coordinator.default_model().to_string());
    let service = match state.coordinator.provider().get_service(&model_id) {
        Ok(service) => service,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Unsupported model: {model_id}"),
            )
                .into_response()
        }
    };

    if let Some(cwd) = request.cwd.as_deref() {
        if !std::path::Path::new(cwd).is_dir() {
            return (
                StatusCode::BAD_REQUEST,
                format!("cwd is not a directory: {cwd}"),
            )
                .into_response();
        }
    }

    let conversation = match state
        .coordinator
        .store()
        .create_conversation(None, request.cwd.clone())
        .await
    {
        Ok(conversation) => conversation,
        Err(e) => return internal_error(e),
    };
    let conversation_id = conversation.conversation_id.clone();

    state
        .coordinator
        .publish_list_update(ConversationListUpdate::update(conversation));

    let manager = match state.coordinator.get_or_create_manager(&conversation_id).await {
        Ok(manager) => manager,
        Err(e) => return core_error_response(e),
    };

    let first_message = match manager
        .accept_user_message(service, &model_id, Message::user(&request.message))
        .await
    {
        Ok(first) => first,
        Err(e) => return core_error_response(e),
    };

    if first_message {
        state.coordinator.fire_slug_generation(
            conversation_id.clone(),
            request.message.clone(),
            model_id,
        );
    }

    (
        StatusCode::CREATED,
        Json(json!({"status": "accepted", "conversation_id": conversation_id})),
    )
        .into_response()
}

pub async fn chat_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.is_empty() {
        return (StatusCode::BAD_REQUEST, "Message is required").into_response();
    }

    let model_id = request
        .model
        .clone()
        .unwrap_or_else(|| state.coordinator.default_model().to_string());
    let service = match state.coordinator.provider().get_service(&model_id) {
        Ok(service) => service,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Unsupported model: {model_id}"),
            )
                .into_response()
        }
    };

    let manager = match state.coordinator.get_or_create_manager(&conversation_id).await {
        Ok(manager) => manager,
        Err(e) => return core_error_response(e),
    };

    let first_message = match manager
        .accept_user_message(service, &model_id, Message::user(&request.message))
        .await
    {
        Ok(first) => first,
        Err(e) => return core_error_response(e),
    };

    if first_message {
        state.coordinator.fire_slug_generation(
            conversation_id.clone(),
            request.message.clone(),
            model_id,
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted"})),
    )
        .into_response()
}

pub async fn cancel_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    let Some(manager) = state.coordinator.manager_if_active(&conversation_id) else {
        return Json(json!({"status": "no_active_conversation"})).into_response();
    };

    if let Err(e) = manager.cancel_conversation().await {
        tracing::error!(conversation_id = %conversation_id, error = %e, "failed to cancel conversation");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to cancel conversation",
        )
            .into_response();
    }

    tracing::info!(conversation_id = %conversation_id, "conversation cancelled");
    Json(json!({"status": "cancelled"})).into_response()
}

// ============================================================================
// Conversation housekeeping
// ============================================================================

pub async fn archive_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.coordinator.store().archive(&conversation_id).await {
        Ok(conversation) => {
            state
                .coordinator
                .publish_list_update(ConversationListUpdate::update(conversation.clone()));
            Json(conversation).into_response()
        }
        Err(e) => core_error_response(e.into()),
    }
}

pub async fn unarchive_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.coordinator.store().unarchive(&conversation_id).await {
        Ok(conversation) => {
            state
                .coordinator
                .publish_list_update(ConversationListUpdate::update(conversation.clone()));
            Json(conversation).into_response()
        }
        Err(e) => core_error_response(e.into()),
    }
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    // A conversation is never hard-deleted out from under an active turn.
    if let Some(manager) = state.coordinator.manager_if_active(&conversation_id) {
        if manager.turn_in_progress().await {
            return (
                StatusCode::CONFLICT,
                "conversation has a turn in progress; cancel it first",
            )
                .into_response();
        }
    }
    state.coordinator.remove_manager(&conversation_id).await;

    match state
        .coordinator
        .store()
        .delete_conversation(&conversation_id)
        .await
    {
        Ok(()) => {
            state
                .coordinator
                .publish_list_update(ConversationListUpdate::delete(&conversation_id));
            Json(json!({"status": "deleted"})).into_response()
        }
        Err(e) => core_error_response(e.into()),
    }
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Response {
    let sanitized = slug::sanitize(&request.slug);
    if sanitized.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "slug is empty after sanitization",
        )
            .into_response();
    }

    match state
        .coordinator
        .store()
        .update_slug(&conversation_id, &sanitized)
        .await
    {
        Ok(conversation) => {
            let coordinator = state.coordinator.clone();
            let id = conversation_id.clone();
            tokio::spawn(async move {
                coordinator.notify_conversation_update(&id).await;
            });
            Json(conversation).into_response()
        }
        Err(e) => core_error_response(e.into()),
    }
}

// ============================================================================
// Utilities
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PathParam {
    #[serde(default)]
    path: Option<String>,
}

pub async fn validate_cwd(Query(params): Query<PathParam>) -> Response {
    let Some(path) = params.path.filter(|p| !p.is_empty()) else {
        return Json(json!({"valid": false, "error": "path is required"})).into_response();
    };

    match std::fs::metadata(&path) {
        Ok(info) if info.is_dir() => Json(json!({"valid": true})).into_response(),
        Ok(_) => {
            Json(json!({"valid": false, "error": "path is not a directory"})).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Json(json!({"valid": false, "error": "directory does not exist"})).into_response()
        }
        Err(e) => Json(json!({"valid": false, "error": e.to_string()})).into_response(),
    }
}

/// Serve a file (screenshots, downloads, spilled logs) from the allowed
/// directories only.
pub async fn read_file(State(state): State<AppState>, Query(params): Query<PathParam>) -> Response {
    let Some(path) = params.path.filter(|p| !p.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "path is required").into_response();
    };

    let Ok(canonical) = std::fs::canonicalize(&path) else {
        return (StatusCode::NOT_FOUND, "file not found").into_response();
    };
    let allowed = state.read_roots.iter().any(|root| {
        std::fs::canonicalize(root)
            .map(|root| canonical.starts_with(root))
            .unwrap_or(false)
    });
    if !allowed {
        return (StatusCode::FORBIDDEN, "path is outside served directories").into_response();
    }

    match tokio::fs::read(&canonical).await {
        Ok(bytes) => {
            let content_type = confab_browse::imageutil::detect_image_type(&bytes)
                .unwrap_or("application/octet-stream");
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn version() -> Response {
    Json(json!({"version": env!("CARGO_PKG_VERSION")})).into_response()
}
