use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::provider::{EmbeddingEngine, FragmentReceiver, GenerativeEngine, RerankEngine};
use super::types::ChatRequest;
use crate::core::config::settings::EngineSettings;
use crate::core::errors::EngineError;

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Client for any endpoint speaking the OpenAI chat/embeddings API
/// (Gemini's compatibility layer, LM Studio, llama.cpp server, vLLM).
/// Reranking goes to the `/rerank` route served by llama.cpp, vLLM and TEI.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
    rerank_model: String,
    temperature: f64,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().filter(|key| !key.trim().is_empty()),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            rerank_model: settings.rerank_model.clone(),
            temperature: settings.temperature,
            client: Client::new(),
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.chat_model,
            "messages": request.messages,
            "stream": stream,
        });

        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature { obj.insert("temperature".to_string(), json!(t)); }
            if let Some(t) = request.max_tokens { obj.insert("max_tokens".to_string(), json!(t)); }
            if let Some(s) = &request.stop { obj.insert("stop".to_string(), json!(s)); }
        }
        body
    }
}

#[async_trait]
impl GenerativeEngine for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn complete(&self, prompt: &str) -> Result<String, EngineError> {
        let request = ChatRequest::from_prompt(prompt).with_temperature(self.temperature);
        let res = self
            .post("/chat/completions")
            .json(&self.chat_body(&request, false))
            .send()
            .await
            .map_err(EngineError::unavailable)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Unavailable(format!("chat error {}: {}", status, text)));
        }

        let payload: Value = res.json().await.map_err(EngineError::response)?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Response("missing choices[0].message.content".to_string()))
    }

    async fn complete_stream(&self, prompt: &str) -> Result<FragmentReceiver, EngineError> {
        let request = ChatRequest::from_prompt(prompt).with_temperature(self.temperature);
        let res = self
            .post("/chat/completions")
            .json(&self.chat_body(&request, true))
            .send()
            .await
            .map_err(EngineError::unavailable)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Unavailable(format!("stream error {}: {}", status, text)));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut lines = SseLineBuffer::default();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        for line in lines.push(&bytes) {
                            match parse_sse_line(&line) {
                                SseLine::Done => return,
                                SseLine::Delta(content) => {
                                    if tx.send(Ok(content)).await.is_err() {
                                        return;
                                    }
                                }
                                SseLine::Error(message) => {
                                    let _ = tx.send(Err(EngineError::Response(message))).await;
                                    return;
                                }
                                SseLine::Skip => {}
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::unavailable(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl EmbeddingEngine for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let res = self
            .post("/embeddings")
            .json(&body)
            .send()
            .await
            .map_err(EngineError::unavailable)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Unavailable(format!("embed error {}: {}", status, text)));
        }

        let payload: Value = res.json().await.map_err(EngineError::response)?;
        parse_embeddings(&payload, texts.len())
    }
}

#[async_trait]
impl RerankEngine for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, EngineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.rerank_model,
            "query": query,
            "documents": texts,
        });

        let res = self
            .post("/rerank")
            .json(&body)
            .send()
            .await
            .map_err(EngineError::unavailable)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Unavailable(format!("rerank error {}: {}", status, text)));
        }

        let payload: Value = res.json().await.map_err(EngineError::response)?;
        parse_rerank(&payload, texts.len())
    }
}

/// Splits a byte stream into complete lines. A network chunk can end inside a
/// multibyte character, so bytes are only decoded once their line is whole.
#[derive(Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Error(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line == "data: [DONE]" {
        return SseLine::Done;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let Ok(json) = serde_json::from_str::<Value>(data.trim()) else {
        return SseLine::Skip;
    };
    if let Some(message) = json["error"]["message"].as_str() {
        return SseLine::Error(message.to_string());
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseLine::Delta(content.to_string()),
        _ => SseLine::Skip,
    }
}

/// Reorders `data[]` by its `index` field and checks the count.
fn parse_embeddings(payload: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EngineError> {
    let data = payload["data"]
        .as_array()
        .ok_or_else(|| EngineError::Response("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(position);
        let vals = item["embedding"]
            .as_array()
            .ok_or_else(|| EngineError::Response(format!("item {} has no embedding", index)))?;
        let vector: Vec<f32> = vals
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);

    if indexed.len() != expected {
        return Err(EngineError::Response(format!(
            "expected {} embeddings, got {}",
            expected,
            indexed.len()
        )));
    }
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

/// Maps `results[].{index, relevance_score}` back to input order.
fn parse_rerank(payload: &Value, expected: usize) -> Result<Vec<f32>, EngineError> {
    let results = payload["results"]
        .as_array()
        .ok_or_else(|| EngineError::Response("missing results array".to_string()))?;
    if results.len() != expected {
        return Err(EngineError::Response(format!(
            "expected {} rerank scores, got {}",
            expected,
            results.len()
        )));
    }

    let mut scores: Vec<Option<f32>> = vec![None; expected];
    for item in results {
        let index = item["index"]
            .as_u64()
            .map(|i| i as usize)
            .ok_or_else(|| EngineError::Response("rerank result has no index".to_string()))?;
        let score = item["relevance_score"]
            .as_f64()
            .ok_or_else(|| EngineError::Response(format!("result {} has no relevance_score", index)))?;
        let slot = scores
            .get_mut(index)
            .ok_or_else(|| EngineError::Response(format!("rerank index {} out of range", index)))?;
        *slot = Some(score as f32);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| EngineError::Response(format!("no rerank score for {}", index)))
        })
        .collect()
}
