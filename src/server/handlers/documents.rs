use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::core::errors::ApiError;
use crate::rag::{Document, IngestReceipt, Metadata};
use crate::state::AppState;

const MAX_TOP_K: usize = 20;
const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .pipeline
        .ingest(Document {
            text: payload.text,
            metadata: payload.metadata,
        })
        .await?;

    Ok(created(receipt))
}

/// Multipart upload: the first part carrying a file name is read as UTF-8
/// text, or as a PDF when the name ends in `.pdf` or the bytes start with
/// the PDF header.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?;

        let text = extract_text(&file_name, bytes.to_vec()).await?;
        tracing::info!(file = %file_name, chars = text.chars().count(), "Extracted uploaded file");

        let receipt = state
            .pipeline
            .ingest(Document::new(text).with_metadata("source", file_name))
            .await?;
        return Ok(created(receipt));
    }

    Err(ApiError::BadRequest("no file part in upload".to_string()))
}

fn created(receipt: IngestReceipt) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "Document uploaded successfully",
            "document_id": receipt.document_id,
            "document_ids": receipt.passage_ids,
            "chunks_count": receipt.count,
        })),
    )
}

fn is_pdf(file_name: &str, bytes: &[u8]) -> bool {
    file_name.to_ascii_lowercase().ends_with(".pdf") || bytes.starts_with(PDF_MAGIC)
}

async fn extract_text(file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("File is empty".to_string()));
    }

    let text = if is_pdf(file_name, &bytes) {
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| ApiError::BadRequest(format!("Invalid file data or format: {}", e)))?
            .map_err(|e| ApiError::BadRequest(format!("Invalid file data or format: {}", e)))?
    } else {
        String::from_utf8(bytes).map_err(|_| {
            ApiError::BadRequest("Invalid file data or format: not UTF-8 text".to_string())
        })?
    };

    if text.trim().is_empty() {
        return Err(ApiError::BadRequest("File is empty".to_string()));
    }
    Ok(text)
}

pub async fn search_documents(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.top_k == 0 || payload.top_k > MAX_TOP_K {
        return Err(ApiError::BadRequest(format!(
            "top_k must be between 1 and {}",
            MAX_TOP_K
        )));
    }

    let hits = state.pipeline.search(&payload.query, payload.top_k).await?;
    let results: Vec<_> = hits
        .into_iter()
        .map(|hit| {
            json!({
                "content": hit.text,
                "metadata": hit.metadata,
                "score": hit.score,
            })
        })
        .collect();

    Ok(Json(json!({
        "count": results.len(),
        "results": results,
    })))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let status = state.pipeline.status().await?;
    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_is_detected_by_name_or_header() {
        assert!(is_pdf("report.PDF", b"anything"));
        assert!(is_pdf("upload.bin", b"%PDF-1.7\n"));
        assert!(!is_pdf("notes.txt", b"plain text"));
    }

    #[tokio::test]
    async fn utf8_files_are_read_as_text() {
        let text = extract_text("notes.txt", "Caf\u{e9} au lait.".as_bytes().to_vec())
            .await
            .unwrap();
        assert_eq!(text, "Caf\u{e9} au lait.");
    }

    #[tokio::test]
    async fn empty_or_blank_files_are_rejected() {
        for bytes in [Vec::new(), b" \n\t".to_vec()] {
            let err = extract_text("empty.txt", bytes).await.unwrap_err();
            assert!(matches!(err, ApiError::BadRequest(message) if message == "File is empty"));
        }
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_bad_request() {
        let err = extract_text("data.txt", vec![0xff, 0xfe, 0x00, 0x41])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(message) if message.starts_with("Invalid file data")));
    }

    #[tokio::test]
    async fn malformed_pdf_is_a_bad_request() {
        let err = extract_text("broken.pdf", b"%PDF-1.4\nnot really a pdf".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
