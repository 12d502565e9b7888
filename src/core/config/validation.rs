use serde_json::{Map, Value};

use crate::pipeline::PipelineError;

const SECTIONS: &[&str] = &[
    "generation",
    "retrieval",
    "cache",
    "history",
    "pipeline",
    "embedding",
    "llm",
    "prompt",
    "ingest",
    "server",
];

/// Structural checks on the raw document, run before deserialization so
/// errors name the offending path.
pub fn validate_config(config: &Value) -> Result<(), PipelineError> {
    let root = match config {
        Value::Object(map) => map,
        Value::Null => return Ok(()),
        _ => return Err(config_type_error("root", "mapping")),
    };
    reject_unknown_keys(root, "", SECTIONS)?;

    if let Some(generation) = expect_optional_object(root, "generation")? {
        reject_unknown_keys(
            generation,
            "generation",
            &[
                "temperature",
                "top_p",
                "max_new_tokens",
                "repetition_penalty",
                "do_sample",
                "max_attempts",
                "timeout_ms",
                "backoff_base_ms",
                "backoff_max_ms",
            ],
        )?;
        validate_f64_field(generation, "generation.temperature", "temperature", 0.0, 2.0)?;
        validate_f64_field(generation, "generation.top_p", "top_p", 0.0, 1.0)?;
        validate_u64_field(generation, "generation.max_new_tokens", "max_new_tokens", 1, 32_768)?;
        validate_f64_field(
            generation,
            "generation.repetition_penalty",
            "repetition_penalty",
            0.0,
            10.0,
        )?;
        validate_bool_field(generation, "generation.do_sample", "do_sample")?;
        validate_u64_field(generation, "generation.max_attempts", "max_attempts", 1, 10)?;
        validate_u64_field(generation, "generation.timeout_ms", "timeout_ms", 1, 3_600_000)?;
        validate_u64_field(
            generation,
            "generation.backoff_base_ms",
            "backoff_base_ms",
            0,
            600_000,
        )?;
        validate_u64_field(
            generation,
            "generation.backoff_max_ms",
            "backoff_max_ms",
            0,
            3_600_000,
        )?;

        if let (Some(base), Some(max)) = (
            generation.get("backoff_base_ms").and_then(Value::as_u64),
            generation.get("backoff_max_ms").and_then(Value::as_u64),
        ) {
            if base > max {
                return Err(PipelineError::Config(
                    "Invalid config at 'generation.backoff_base_ms': must not exceed backoff_max_ms"
                        .to_string(),
                ));
            }
        }
    }

    if let Some(retrieval) = expect_optional_object(root, "retrieval")? {
        reject_unknown_keys(retrieval, "retrieval", &["top_k", "per_category"])?;
        validate_u64_field(retrieval, "retrieval.top_k", "top_k", 1, 1_000)?;
        validate_bool_field(retrieval, "retrieval.per_category", "per_category")?;
    }

    if let Some(cache) = expect_optional_object(root, "cache")? {
        reject_unknown_keys(cache, "cache", &["capacity", "shards"])?;
        validate_u64_field(cache, "cache.capacity", "capacity", 1, 1_000_000)?;
        validate_u64_field(cache, "cache.shards", "shards", 1, 256)?;
    }

    if let Some(history) = expect_optional_object(root, "history")? {
        reject_unknown_keys(history, "history", &["window"])?;
        validate_u64_field(history, "history.window", "window", 0, 1_000)?;
    }

    if let Some(pipeline) = expect_optional_object(root, "pipeline")? {
        reject_unknown_keys(pipeline, "pipeline", &["max_total_latency_ms"])?;
        validate_u64_field(
            pipeline,
            "pipeline.max_total_latency_ms",
            "max_total_latency_ms",
            1,
            3_600_000,
        )?;
    }

    if let Some(embedding) = expect_optional_object(root, "embedding")? {
        reject_unknown_keys(
            embedding,
            "embedding",
            &[
                "provider",
                "dimension",
                "max_input_chars",
                "truncate_long_inputs",
                "base_url",
                "model",
            ],
        )?;
        validate_enum_field(embedding, "embedding.provider", "provider", &["hashing", "http"])?;
        validate_u64_field(embedding, "embedding.dimension", "dimension", 1, 16_384)?;
        validate_u64_field(
            embedding,
            "embedding.max_input_chars",
            "max_input_chars",
            1,
            1_000_000,
        )?;
        validate_bool_field(embedding, "embedding.truncate_long_inputs", "truncate_long_inputs")?;
        validate_optional_string_field(embedding, "embedding.base_url", "base_url")?;
        validate_optional_string_field(embedding, "embedding.model", "model")?;

        if embedding.get("provider").and_then(Value::as_str) == Some("http") {
            validate_required_string_field(embedding, "embedding.base_url", "base_url")?;
            validate_required_string_field(embedding, "embedding.model", "model")?;
        }
    }

    if let Some(llm) = expect_optional_object(root, "llm")? {
        reject_unknown_keys(llm, "llm", &["base_url", "model", "api_key"])?;
        validate_optional_string_field(llm, "llm.base_url", "base_url")?;
        validate_optional_string_field(llm, "llm.model", "model")?;
        validate_optional_string_field(llm, "llm.api_key", "api_key")?;
    }

    if let Some(prompt) = expect_optional_object(root, "prompt")? {
        reject_unknown_keys(prompt, "prompt", &["system_prompt"])?;
        validate_required_string_field(prompt, "prompt.system_prompt", "system_prompt")?;
    }

    if let Some(ingest) = expect_optional_object(root, "ingest")? {
        reject_unknown_keys(ingest, "ingest", &["database_path", "tables"])?;
        validate_optional_string_field(ingest, "ingest.database_path", "database_path")?;

        if let Some(tables) = ingest.get("tables") {
            let tables = tables
                .as_array()
                .ok_or_else(|| config_type_error("ingest.tables", "array"))?;
            for (index, value) in tables.iter().enumerate() {
                let path_prefix = format!("ingest.tables[{}]", index);
                let entry = value
                    .as_object()
                    .ok_or_else(|| config_type_error(&path_prefix, "mapping"))?;
                reject_unknown_keys(
                    entry,
                    &path_prefix,
                    &["table", "category", "id_column", "columns"],
                )?;
                for key in ["table", "category", "id_column"] {
                    validate_required_string_field(entry, &format!("{}.{}", path_prefix, key), key)?;
                }
                let columns_path = format!("{}.columns", path_prefix);
                if !entry.contains_key("columns") {
                    return Err(PipelineError::Config(format!(
                        "Invalid config at '{}': value is required",
                        columns_path
                    )));
                }
                validate_string_array_field(entry, &columns_path, "columns")?;
            }
        }
    }

    if let Some(server) = expect_optional_object(root, "server")? {
        reject_unknown_keys(server, "server", &["host", "port"])?;
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 1, 65_535)?;
    }

    Ok(())
}

fn reject_unknown_keys(
    section: &Map<String, Value>,
    path: &str,
    allowed: &[&str],
) -> Result<(), PipelineError> {
    for key in section.keys() {
        if !allowed.contains(&key.as_str()) {
            let full = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", path, key)
            };
            return Err(PipelineError::Config(format!(
                "Unknown config key '{}'",
                full
            )));
        }
    }
    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, PipelineError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(config_type_error(key, "mapping")),
    }
}

fn validate_bool_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), PipelineError> {
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
) -> Result<(), PipelineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "non-negative integer"));
    };
    if number < min || number > max {
        return Err(PipelineError::Config(format!(
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
) -> Result<(), PipelineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if !(min..=max).contains(&number) {
        return Err(PipelineError::Config(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_enum_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    variants: &[&str],
) -> Result<(), PipelineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    match value.as_str() {
        Some(text) if variants.contains(&text) => Ok(()),
        _ => Err(config_type_error(path, &format!("one of {}", variants.join(", ")))),
    }
}

fn validate_required_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), PipelineError> {
    let value = section.get(key).ok_or_else(|| {
        PipelineError::Config(format!("Invalid config at '{}': value is required", path))
    })?;
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if text.trim().is_empty() {
        return Err(PipelineError::Config(format!(
            "Invalid config at '{}': value cannot be empty",
            path
        )));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), PipelineError> {
    match section.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(config_type_error(path, "string")),
    }
}

fn validate_string_array_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), PipelineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(items) = value.as_array() else {
        return Err(config_type_error(path, "array of strings"));
    };
    if items.is_empty() {
        return Err(PipelineError::Config(format!(
            "Invalid config at '{}': must not be empty",
            path
        )));
    }
    for (index, item) in items.iter().enumerate() {
        let Some(text) = item.as_str() else {
            return Err(config_type_error(&format!("{}[{}]", path, index), "string"));
        };
        if text.trim().is_empty() {
            return Err(PipelineError::Config(format!(
                "Invalid config at '{}[{}]': value cannot be empty",
                path, index
            )));
        }
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> PipelineError {
    PipelineError::Config(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}
