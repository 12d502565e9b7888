use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::paths::AppPaths;
use super::settings::ChatbotConfig;
use super::validation::validate_config;
use crate::pipeline::PipelineError;

const REDACT_PLACEHOLDER: &str = "****";

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
        if let Ok(path) = env::var("DENTAL_RAG_CONFIG") {
            return PathBuf::from(path);
        }

        let data_config = self.paths.data_dir.join("config.yml");
        if data_config.exists() {
            return data_config;
        }

        PathBuf::from("config.yml")
    }

    pub fn load_config(&self) -> Result<ChatbotConfig, PipelineError> {
        let mut config = load_config_file(&self.config_path())?;
        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm.api_key = Some(key);
            }
        }
        Ok(config)
    }
}

/// Reads and validates one YAML file. A missing file yields defaults.
pub fn load_config_file(path: &Path) -> Result<ChatbotConfig, PipelineError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "No config file found, using defaults");
        return Ok(ChatbotConfig::default());
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = parse_config(&contents)?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<ChatbotConfig, PipelineError> {
    let raw: Value = serde_yaml::from_str(contents)
        .map_err(|e| PipelineError::Config(format!("Invalid YAML: {}", e)))?;
    validate_config(&raw)?;

    if raw.is_null() {
        return Ok(ChatbotConfig::default());
    }
    serde_json::from_value(raw).map_err(|e| PipelineError::Config(e.to_string()))
}

/// Config rendered for the startup log, secrets masked.
pub fn redacted(config: &ChatbotConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    if let Some(key) = value.pointer_mut("/llm/api_key") {
        if !key.is_null() {
            *key = Value::String(REDACT_PLACEHOLDER.to_string());
        }
    }
    value
}
