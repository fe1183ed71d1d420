use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::handlers::{chat, config, documents, health};
use crate::server::ws::handler::ws_handler;
use crate::state::AppState;

/// Creates the main application router with all routes and middleware.
///
/// This function sets up:
/// - CORS middleware
/// - Health and config endpoints
/// - Document ingest, search and status endpoints
/// - Batch RAG endpoint and the streaming WebSocket handler
pub fn router(state: Arc<AppState>) -> Router {
    let cors_layer = build_cors_layer(&state.settings.server.allowed_origins);
    Router::new()
        .route("/health", get(health::health))
        .route("/api/config", get(config::get_config))
        .route("/api/documents", post(documents::upload_document))
        .route("/api/documents/upload", post(documents::upload_file))
        .route("/api/documents/search", post(documents::search_documents))
        .route("/api/documents/status", get(documents::get_status))
        .route("/api/chat/rag", post(chat::rag_query))
        .route("/api/chat/ws", get(ws_handler))
        .fallback(health::not_found)
        .with_state(state)
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer(configured: &[String]) -> CorsLayer {
    let origins = resolve_allowed_origins(configured);

    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect::<Vec<_>>(),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE])
}

fn resolve_allowed_origins(configured: &[String]) -> Vec<String> {
    let origins: Vec<String> = configured
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();

    if origins.is_empty() {
        return default_local_origins();
    }

    origins
}

fn default_local_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
        "http://127.0.0.1".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
        "http://127.0.0.1:8000".to_string(),
    ]
}
