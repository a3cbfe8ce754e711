//! API router

use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, AppState};

/// Build the complete axum router with all API routes.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations", get(handlers::list_conversations))
        .route(
            "/api/conversations/archived",
            get(handlers::list_archived_conversations),
        )
        .route("/api/conversations/new", post(handlers::new_conversation))
        .route("/api/conversation/:id", get(handlers::get_conversation))
        .route(
            "/api/conversation/:id/stream",
            get(handlers::stream_conversation),
        )
        .route(
            "/api/conversation/:id/chat",
            post(handlers::chat_conversation),
        )
        .route(
            "/api/conversation/:id/cancel",
            post(handlers::cancel_conversation),
        )
        .route(
            "/api/conversation/:id/archive",
            post(handlers::archive_conversation),
        )
        .route(
            "/api/conversation/:id/unarchive",
            post(handlers::unarchive_conversation),
        )
        .route(
            "/api/conversation/:id/delete",
            post(handlers::delete_conversation),
        )
        .route(
            "/api/conversation/:id/rename",
            post(handlers::rename_conversation),
        )
        .route(
            "/api/conversation-by-slug/:slug",
            get(handlers::get_conversation_by_slug),
        )
        .route("/api/validate-cwd", get(handlers::validate_cwd))
        .route("/api/read", get(handlers::read_file))
        .route("/version", get(handlers::version))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
