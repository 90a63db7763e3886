use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::paths::AppPaths;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 10] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "token_",
    "credential",
    "private_key",
    "auth_",
    "access_key",
    "bearer",
];

const SENSITIVE_WHITELIST: [&str; 4] = ["max_tokens", "total_tokens", "token_count", "tokens"];

/// Environment variables mapped onto config keys. Later entries win, so the
/// generic `LLM_API_KEY` overrides the Hugging Face alias when both are set.
const ENV_OVERRIDES: [(&str, &str, EnvKind); 17] = [
    ("HF_API_TOKEN", "llm.api_key", EnvKind::Text),
    ("LLM_API_KEY", "llm.api_key", EnvKind::Text),
    ("LLM_MODEL", "llm.model", EnvKind::Text),
    ("LLM_PROVIDER", "llm.provider", EnvKind::Text),
    ("LLM_BASE_URL", "llm.base_url", EnvKind::Text),
    ("EMBEDDING_PROVIDER", "embedding.provider", EnvKind::Text),
    ("EMBEDDING_MODEL", "embedding.model", EnvKind::Text),
    ("EMBEDDING_BASE_URL", "embedding.base_url", EnvKind::Text),
    ("EMBEDDING_API_KEY", "embedding.api_key", EnvKind::Text),
    ("VECTOR_STORE_TYPE", "store.kind", EnvKind::Text),
    ("SQLITE_DB_PATH", "store.sqlite_path", EnvKind::Text),
    ("FLAT_DB_PATH", "store.flat_path", EnvKind::Text),
    ("CHUNK_SIZE", "chunking.chunk_size", EnvKind::Integer),
    ("CHUNK_OVERLAP", "chunking.chunk_overlap", EnvKind::Integer),
    ("HOST", "server.host", EnvKind::Text),
    ("PORT", "server.port", EnvKind::Integer),
    ("JOB_WORKERS", "jobs.workers", EnvKind::Integer),
];

#[derive(Debug, Clone, Copy)]
enum EnvKind {
    Text,
    Integer,
}

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
        if let Ok(path) = env::var("RAG_CONFIG_PATH") {
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

    /// Merge `config.yml`, `secrets.yaml` and environment overrides into one tree.
    pub fn load_config(&self) -> Value {
        let public_config = load_yaml_file(&self.config_path());
        let secrets_config = load_yaml_file(&self.secrets_path());
        let mut merged = deep_merge(&public_config, &secrets_config);
        apply_env_overrides(&mut merged, |key| env::var(key).ok());
        merged
    }

    pub fn redact_sensitive_values(&self, value: &Value) -> Value {
        redact_sensitive_values(value)
    }
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
                tracing::warn!("Ignoring unparsable config file {}: {}", path.display(), err);
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
    for (var, path, kind) in ENV_OVERRIDES {
        let Some(raw) = lookup(var) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let value = match kind {
            EnvKind::Text => Value::String(raw.to_string()),
            EnvKind::Integer => match raw.parse::<u64>() {
                Ok(number) => Value::from(number),
                Err(_) => {
                    tracing::warn!("Ignoring {}={:?}: not an integer", var, raw);
                    continue;
                }
            },
        };
        set_path(config, path, value);
    }
}

fn set_path(config: &mut Value, dotted: &str, value: Value) {
    let parts: Vec<&str> = dotted.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut current = config;
    for part in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_merges_objects_and_overrides_scalars() {
        let base = json!({
            "llm": { "model": "a", "max_tokens": 250 },
            "store": { "kind": "sqlite" }
        });
        let secrets = json!({
            "llm": { "api_key": "hf_secret" }
        });

        let merged = deep_merge(&base, &secrets);

        assert_eq!(
            merged,
            json!({
                "llm": { "model": "a", "max_tokens": 250, "api_key": "hf_secret" },
                "store": { "kind": "sqlite" }
            })
        );
    }

    #[test]
    fn env_overrides_win_and_parse_integers() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HF_API_TOKEN", "hf_alias"),
            ("LLM_API_KEY", "primary"),
            ("VECTOR_STORE_TYPE", "flat"),
            ("CHUNK_SIZE", "256"),
            ("PORT", "not-a-number"),
        ]);
        let mut config = json!({ "store": { "kind": "sqlite" }, "server": { "port": 9000 } });

        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config["llm"]["api_key"], "primary");
        assert_eq!(config["store"]["kind"], "flat");
        assert_eq!(config["chunking"]["chunk_size"], 256);
        assert_eq!(config["server"]["port"], 9000);
    }

    #[test]
    fn redact_sensitive_values_replaces_secrets_only() {
        let input = json!({
            "llm": {
                "api_key": "secret",
                "max_tokens": 250
            },
            "embedding": { "api_key": null, "model": "mini" }
        });

        let redacted = redact_sensitive_values(&input);

        assert_eq!(
            redacted,
            json!({
                "llm": {
                    "api_key": "****",
                    "max_tokens": 250
                },
                "embedding": { "api_key": null, "model": "mini" }
            })
        );
    }

    #[test]
    fn missing_and_malformed_files_load_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let broken = tmp.path().join("config.yml");
        fs::write(&broken, "llm: [unterminated").unwrap();

        assert_eq!(load_yaml_file(&broken), json!({}));
        assert_eq!(load_yaml_file(&tmp.path().join("absent.yml")), json!({}));
    }
}
