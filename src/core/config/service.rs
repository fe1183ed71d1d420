use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::paths::AppPaths;
use super::settings::AppSettings;
use super::validation::{validate_config, validate_settings};
use crate::core::errors::RagError;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 8] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "token_",
    "credential",
    "private_key",
    "bearer",
];

const SENSITIVE_WHITELIST: [&str; 3] = ["max_tokens", "total_tokens", "tokens"];

/// Environment variables layered over the YAML files, as
/// `(variable, dotted config path)`.
const ENV_OVERRIDES: [(&str, &str); 4] = [
    ("DOCQA_API_KEY", "engines.api_key"),
    ("DOCQA_ENGINE_BASE_URL", "engines.base_url"),
    ("DOCQA_PERSIST_DIR", "index.persist_directory"),
    ("PORT", "server.port"),
];

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("DOCQA_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.user_data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.paths.secrets_path.clone()
    }

    /// Public config deep-merged with the secrets file.
    pub fn load_config(&self) -> Value {
        let public_config = load_yaml_file(&self.config_path());
        let secrets_config = load_yaml_file(&self.secrets_path());
        deep_merge(&public_config, &secrets_config)
    }

    pub fn load_settings(&self) -> Result<AppSettings, RagError> {
        let mut raw = self.load_config();
        apply_env_overrides(&mut raw, |key| env::var(key).ok());
        let mut settings = settings_from_value(raw)?;

        if settings.index.persist_directory.is_none() {
            settings.index.persist_directory = Some(self.paths.vector_store_dir.clone());
        }
        Ok(settings)
    }

    pub fn redact_sensitive_values(&self, value: &Value) -> Value {
        redact_sensitive_values(value)
    }
}

/// Validates and deserializes a merged config document.
pub fn settings_from_value(raw: Value) -> Result<AppSettings, RagError> {
    validate_config(&raw)?;
    let settings: AppSettings = serde_json::from_value(raw)
        .map_err(|e| RagError::InvalidConfig(e.to_string()))?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn load_yaml_file(path: &Path) -> Value {
    if !path.exists() {
        return Value::Object(Map::new());
    }

    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<Value>(&contents) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => Value::Object(Map::new()),
            Err(err) => {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), err);
                Value::Object(Map::new())
            }
        },
        Err(_) => Value::Object(Map::new()),
    }
}

fn apply_env_overrides<F>(config: &mut Value, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for (var, path) in ENV_OVERRIDES {
        let Some(raw) = lookup(var) else {
            continue;
        };
        let value = if path == "server.port" {
            match raw.parse::<u64>() {
                Ok(port) => json!(port),
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric {}={}", var, raw);
                    continue;
                }
            }
        } else {
            Value::String(raw)
        };
        set_path(config, path, value);
    }
}

fn set_path(config: &mut Value, dotted: &str, value: Value) {
    let mut current = config;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

fn redact_sensitive_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_null() {
                    redacted.insert(key.clone(), Value::String(REDACT_PLACEHOLDER.to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_values(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_values).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_WHITELIST
        .iter()
        .any(|allowed| *allowed == key_lower)
    {
        return false;
    }
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| key_lower.contains(pattern))
}
