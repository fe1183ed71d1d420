use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scalar metadata value attached to documents and passages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        MetadataValue::Int(value as i64)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Raw ingest input. Not retained after chunking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Chunker output waiting for an id and an embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPassage {
    pub text: String,
    pub metadata: Metadata,
}

/// Stored passage. Immutable once the index accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    /// Higher is more relevant.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub collection_name: String,
    pub document_count: usize,
    pub is_persistent: bool,
}

const EXCERPT_CHARS: usize = 100;

/// Leading excerpt of a passage that contributed to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceExcerpt {
    pub passage_id: String,
    pub excerpt: String,
    pub score: f32,
}

impl SourceExcerpt {
    pub fn from_scored(scored: &ScoredPassage) -> Self {
        let text = &scored.passage.text;
        let excerpt = if text.chars().count() > EXCERPT_CHARS {
            let head: String = text.chars().take(EXCERPT_CHARS).collect();
            format!("{}...", head)
        } else {
            text.clone()
        };
        Self {
            passage_id: scored.passage.id.clone(),
            excerpt,
            score: scored.score,
        }
    }
}
