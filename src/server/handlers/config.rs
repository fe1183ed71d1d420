use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

use crate::state::AppState;

/// Effective settings with secrets redacted.
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let effective = serde_json::to_value(state.settings.as_ref()).unwrap_or_default();
    Json(state.config.redact_sensitive_values(&effective))
}
