use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::core::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RagRequest {
    pub query: String,
}

pub async fn rag_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RagRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let preview: String = payload.query.chars().take(50).collect();
    tracing::info!("Received RAG query: {}", preview);

    let answer = state.pipeline.answer(&payload.query).await?;
    Ok(Json(json!({
        "answer": answer.answer_text,
        "sources": answer.sources,
        "rewritten_query": answer.rewritten_query,
        "degraded": answer.degraded,
    })))
}
