use serde_json::{Map, Value};

use super::settings::AppSettings;
use crate::core::errors::RagError;

/// Checks the raw merged config before it is deserialized, so type errors
/// are reported with their dotted path instead of a serde message.
pub fn validate_config(config: &Value) -> Result<(), RagError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(server) = expect_optional_object(root, "server")? {
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 0, 65_535)?;
        validate_string_array_field(server, "server.allowed_origins", "allowed_origins")?;
    }

    if let Some(engines) = expect_optional_object(root, "engines")? {
        validate_optional_string_field(engines, "engines.base_url", "base_url")?;
        validate_optional_string_field(engines, "engines.chat_model", "chat_model")?;
        validate_optional_string_field(engines, "engines.embedding_model", "embedding_model")?;
        validate_optional_string_field(engines, "engines.rerank_model", "rerank_model")?;
        validate_f64_field(engines, "engines.temperature", "temperature", 0.0, 2.0)?;
        validate_u64_field(
            engines,
            "engines.hashing_dimensions",
            "hashing_dimensions",
            1,
            65_536,
        )?;
    }

    if let Some(index) = expect_optional_object(root, "index")? {
        validate_optional_string_field(index, "index.collection_name", "collection_name")?;
        validate_bool_field(index, "index.persistent", "persistent")?;
        validate_optional_string_field(index, "index.persist_directory", "persist_directory")?;
    }

    if let Some(chunking) = expect_optional_object(root, "chunking")? {
        validate_u64_field(chunking, "chunking.chunk_size", "chunk_size", 1, 1_000_000)?;
        validate_u64_field(
            chunking,
            "chunking.chunk_overlap",
            "chunk_overlap",
            0,
            1_000_000,
        )?;
    }

    if let Some(retrieval) = expect_optional_object(root, "retrieval")? {
        validate_u64_field(retrieval, "retrieval.k", "k", 1, 1_000)?;
    }

    if let Some(rerank) = expect_optional_object(root, "rerank")? {
        validate_u64_field(rerank, "rerank.top_n", "top_n", 1, 1_000)?;
        validate_optional_string_field(rerank, "rerank.engine", "engine")?;
        validate_optional_string_field(rerank, "rerank.fallback", "fallback")?;
        validate_f64_field(rerank, "rerank.keyword_weight", "keyword_weight", 0.0, 1.0)?;
    }

    if let Some(rewrite) = expect_optional_object(root, "rewrite")? {
        validate_bool_field(rewrite, "rewrite.enabled", "enabled")?;
    }

    if let Some(context) = expect_optional_object(root, "context")? {
        validate_u64_field(context, "context.max_chars", "max_chars", 1, 10_000_000)?;
        validate_bool_field(context, "context.include_citations", "include_citations")?;
    }

    if let Some(generation) = expect_optional_object(root, "generation")? {
        validate_u64_field(generation, "generation.stream_buffer", "stream_buffer", 1, 1_024)?;
    }

    if let Some(timeouts) = expect_optional_object(root, "timeouts")? {
        for key in ["embed_ms", "rewrite_ms", "rerank_ms", "generate_ms"] {
            validate_u64_field(timeouts, &format!("timeouts.{}", key), key, 1, 3_600_000)?;
        }
    }

    Ok(())
}

/// Cross-field rules that only make sense on the typed settings.
pub fn validate_settings(settings: &AppSettings) -> Result<(), RagError> {
    if settings.index.collection_name.trim().is_empty() {
        return Err(RagError::InvalidConfig(
            "index.collection_name cannot be empty".to_string(),
        ));
    }
    if settings.chunking.chunk_overlap >= settings.chunking.chunk_size {
        return Err(RagError::InvalidConfig(format!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            settings.chunking.chunk_overlap, settings.chunking.chunk_size
        )));
    }
    if settings.rerank.top_n > settings.retrieval.k {
        return Err(RagError::InvalidConfig(format!(
            "rerank.top_n ({}) cannot exceed retrieval.k ({})",
            settings.rerank.top_n, settings.retrieval.k
        )));
    }
    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, RagError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(config_type_error(key, "object")),
        None => Ok(None),
    }
}

fn validate_bool_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_bool().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "boolean"))
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(RagError::InvalidConfig(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_f64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: f64,
    max: f64,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if number < min || number > max {
        return Err(RagError::InvalidConfig(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), RagError> {
    match section.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(config_type_error(path, "string")),
    }
}

fn validate_string_array_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(items) = value.as_array() else {
        return Err(config_type_error(path, "array of strings"));
    };
    for (index, item) in items.iter().enumerate() {
        let Some(text) = item.as_str() else {
            return Err(config_type_error(&format!("{}[{}]", path, index), "string"));
        };
        if text.trim().is_empty() {
            return Err(RagError::InvalidConfig(format!(
                "Invalid config at '{}[{}]': value cannot be empty",
                path, index
            )));
        }
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> RagError {
    RagError::InvalidConfig(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_empty_config() {
        assert!(validate_config(&json!({})).is_ok());
    }

    #[test]
    fn rejects_wrong_types_with_path() {
        let err = validate_config(&json!({ "chunking": { "chunk_size": "big" } })).unwrap_err();
        assert!(err.to_string().contains("chunking.chunk_size"));

        let err = validate_config(&json!({ "rewrite": { "enabled": 1 } })).unwrap_err();
        assert!(err.to_string().contains("rewrite.enabled"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = validate_config(&json!({ "retrieval": { "k": 0 } })).unwrap_err();
        assert!(matches!(err, RagError::InvalidConfig(_)));
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut settings = AppSettings::default();
        settings.chunking.chunk_size = 100;
        settings.chunking.chunk_overlap = 100;
        assert!(validate_settings(&settings).is_err());

        settings.chunking.chunk_overlap = 99;
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn top_n_cannot_exceed_k() {
        let mut settings = AppSettings::default();
        settings.retrieval.k = 2;
        settings.rerank.top_n = 3;
        assert!(validate_settings(&settings).is_err());
    }
}
