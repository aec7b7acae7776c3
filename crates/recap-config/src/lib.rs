use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KLAVIYO_KEY_ENV: &str = "KLAVIYO_PRIVATE_API_KEY";
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_ENV: &str = "OPENAI_API_BASE";

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub klaviyo: Klaviyo,
    pub digest: Digest,
    pub ai: Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Klaviyo {
    pub api_base: String,
    pub revision: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ai {
    pub model: String,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

/// Credentials are never part of the YAML file; they are resolved from the
/// environment at startup. The CRM key is mandatory, the LLM key optional
/// (its absence disables AI enrichment rather than failing startup).
#[derive(Debug, Clone)]
pub struct Secrets {
    pub klaviyo_private_key: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
}

fn default_page_size() -> usize {
    200
}

fn default_max_pages() -> usize {
    5
}

fn default_window_days() -> u32 {
    7
}

fn default_max_events() -> usize {
    50
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

pub fn secrets_from_env() -> Result<Secrets, ConfigError> {
    let klaviyo_private_key = std::env::var(KLAVIYO_KEY_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(KLAVIYO_KEY_ENV.to_string()))?;

    let openai_api_key = std::env::var(OPENAI_KEY_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let openai_api_base = std::env::var(OPENAI_BASE_ENV)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE.to_string());

    Ok(Secrets {
        klaviyo_private_key,
        openai_api_key,
        openai_api_base,
    })
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.klaviyo.api_base.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "klaviyo.api_base must not be empty".to_string(),
        ));
    }
    if cfg.klaviyo.revision.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "klaviyo.revision must not be empty".to_string(),
        ));
    }
    if cfg.klaviyo.page_size == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "klaviyo.page_size must be >= 1".to_string(),
        ));
    }
    if cfg.klaviyo.max_pages == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "klaviyo.max_pages must be >= 1".to_string(),
        ));
    }
    if cfg.digest.window_days == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "digest.window_days must be >= 1".to_string(),
        ));
    }
    if cfg.ai.model.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "ai.model must not be empty".to_string(),
        ));
    }
    if cfg.ai.max_events == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "ai.max_events must be >= 1".to_string(),
        ));
    }
    Ok(())
}
