use serde_json::{Map, Value};

use crate::core::errors::RagError;

pub fn validate_config(config: &Value) -> Result<(), RagError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(server) = expect_optional_object(root, "server")? {
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 1, 65_535)?;
        validate_string_array_field(
            server,
            "server.cors_allowed_origins",
            "cors_allowed_origins",
        )?;
    }

    if let Some(llm) = expect_optional_object(root, "llm")? {
        validate_optional_string_field(llm, "llm.model", "model")?;
        validate_optional_string_field(llm, "llm.provider", "provider")?;
        validate_optional_string_field(llm, "llm.base_url", "base_url")?;
        validate_optional_string_field(llm, "llm.api_key", "api_key")?;
        validate_u64_field(llm, "llm.max_tokens", "max_tokens", 1, 32_768)?;
        validate_f64_field(llm, "llm.temperature", "temperature", 0.0, 2.0)?;
    }

    if let Some(embedding) = expect_optional_object(root, "embedding")? {
        validate_enum_field(
            embedding,
            "embedding.provider",
            "provider",
            &["remote", "local", "hashing"],
        )?;
        validate_optional_string_field(embedding, "embedding.model", "model")?;
        validate_optional_string_field(embedding, "embedding.base_url", "base_url")?;
        validate_u64_field(embedding, "embedding.dimension", "dimension", 1, 65_536)?;
    }

    if let Some(store) = expect_optional_object(root, "store")? {
        validate_enum_field(store, "store.kind", "kind", &["sqlite", "flat"])?;
        validate_optional_string_field(store, "store.sqlite_path", "sqlite_path")?;
        validate_optional_string_field(store, "store.flat_path", "flat_path")?;
        validate_u64_field(store, "store.batch_size", "batch_size", 1, 100_000)?;
        validate_bool_field(store, "store.refresh_on_query", "refresh_on_query")?;
    }

    if let Some(rag) = expect_optional_object(root, "rag")? {
        validate_u64_field(rag, "rag.default_k", "default_k", 1, 1_000)?;
        validate_u64_field(rag, "rag.max_context_chars", "max_context_chars", 1, 1_000_000)?;
        validate_u64_field(rag, "rag.min_fragment_chars", "min_fragment_chars", 0, 1_000_000)?;
        validate_u64_field(rag, "rag.preview_chars", "preview_chars", 1, 1_000_000)?;
        validate_ordered_pair(
            rag,
            "rag.min_fragment_chars",
            "min_fragment_chars",
            "max_context_chars",
        )?;
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
        validate_ordered_pair(
            chunking,
            "chunking.chunk_overlap",
            "chunk_overlap",
            "chunk_size",
        )?;
    }

    if let Some(jobs) = expect_optional_object(root, "jobs")? {
        validate_u64_field(jobs, "jobs.workers", "workers", 1, 64)?;
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
        return Err(RagError::Config(format!(
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
    if !(min..=max).contains(&number) {
        return Err(RagError::Config(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

/// `lower` must stay strictly below `upper` when both are present.
fn validate_ordered_pair(
    section: &Map<String, Value>,
    path: &str,
    lower: &str,
    upper: &str,
) -> Result<(), RagError> {
    let low = section.get(lower).and_then(Value::as_u64);
    let high = section.get(upper).and_then(Value::as_u64);
    if let (Some(low), Some(high)) = (low, high) {
        if low >= high {
            return Err(RagError::Config(format!(
                "Invalid config at '{}': must be smaller than {}",
                path, upper
            )));
        }
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.is_null() || value.as_str().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "string"))
}

fn validate_enum_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    allowed: &[&str],
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if allowed.contains(&text) {
        return Ok(());
    }
    Err(RagError::Config(format!(
        "Invalid config at '{}': '{}' is not one of {}",
        path,
        text,
        allowed.join(", ")
    )))
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
            return Err(RagError::Config(format!(
                "Invalid config at '{}[{}]': value cannot be empty",
                path, index
            )));
        }
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> RagError {
    RagError::Config(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_empty_and_complete_configs() {
        assert!(validate_config(&json!({})).is_ok());
        assert!(validate_config(&json!({
            "server": { "host": "0.0.0.0", "port": 8000 },
            "llm": { "model": "m", "max_tokens": 250, "temperature": 0.7 },
            "embedding": { "provider": "hashing", "dimension": 64 },
            "store": { "kind": "flat", "batch_size": 100, "refresh_on_query": false },
            "rag": { "max_context_chars": 1500, "min_fragment_chars": 50 },
            "chunking": { "chunk_size": 512, "chunk_overlap": 50 },
            "jobs": { "workers": 2 }
        }))
        .is_ok());
    }

    #[test]
    fn rejects_out_of_range_numbers() {
        let err = validate_config(&json!({ "server": { "port": 0 } })).unwrap_err();
        assert!(err.to_string().contains("server.port"));

        let err = validate_config(&json!({ "llm": { "temperature": 3.5 } })).unwrap_err();
        assert!(err.to_string().contains("llm.temperature"));
    }

    #[test]
    fn rejects_unknown_store_kind() {
        let err = validate_config(&json!({ "store": { "kind": "pinecone" } })).unwrap_err();
        assert!(err.to_string().contains("store.kind"));
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let err = validate_config(&json!({
            "chunking": { "chunk_size": 100, "chunk_overlap": 100 }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("chunking.chunk_overlap"));
    }

    #[test]
    fn wrong_section_type_is_reported() {
        let err = validate_config(&json!({ "store": "sqlite" })).unwrap_err();
        assert!(err.to_string().contains("expected object"));
    }
}
