//! TOML configuration with environment overrides.
//!
//! Every field has a default, so a missing config file still yields a
//! runnable service. After the file is parsed, the environment variables
//! listed in [`Config::apply_env`] override it (a `.env` file is honoured by
//! the binary via `dotenv`).

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provision::ModelType;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `local` (fastembed), `ollama`, or `hashed`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Ollama base URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_persist_directory")]
    pub persist_directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persist_directory: default_persist_directory(),
        }
    }
}

fn default_persist_directory() -> PathBuf {
    PathBuf::from("db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Staging area for uploads; files are removed once ingested.
    #[serde(default = "default_source_directory")]
    pub source_directory: PathBuf,
    /// Maximum chunk length in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Bytes shared between consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_directory: default_source_directory(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_source_directory() -> PathBuf {
    PathBuf::from("source_documents")
}
fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_max_file_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `LlamaCpp` or `GPT4All`. Unset means generation is unavailable.
    #[serde(default)]
    pub model_type: Option<String>,
    /// Use this weight file instead of provisioning one.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_models_directory")]
    pub models_directory: PathBuf,
    /// Context window in tokens.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,
    /// Tokens reserved for the answer.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub threads: Option<usize>,
    /// `0` disables the bound.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: None,
            model_path: None,
            models_directory: default_models_directory(),
            n_ctx: default_n_ctx(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            threads: None,
            generation_timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_models_directory() -> PathBuf {
    PathBuf::from("models")
}
fn default_n_ctx() -> usize {
    1000
}
fn default_max_tokens() -> usize {
    256
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_timeout_secs() -> u64 {
    300
}

impl ModelConfig {
    /// Parsed model type, `None` when unconfigured.
    pub fn model_type(&self) -> Result<Option<ModelType>> {
        self.model_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse())
            .transpose()
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        match self.generation_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Request body limit for `/embed` uploads.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    256 * 1024 * 1024
}

/// Log levels: a default plus per-module overrides. `RUST_LOG` wins over both.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub default: String,
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Override file settings from environment-style lookups.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `EMBEDDINGS_MODEL_NAME` | `embedding.model` |
    /// | `PERSIST_DIRECTORY` | `store.persist_directory` |
    /// | `MODEL_TYPE` | `model.model_type` |
    /// | `MODEL_PATH` | `model.model_path` |
    /// | `MODEL_N_CTX` | `model.n_ctx` |
    /// | `SOURCE_DIRECTORY` | `ingest.source_directory` |
    /// | `TARGET_SOURCE_CHUNKS` | `retrieval.top_k` |
    /// | `BIND_ADDRESS` | `server.bind` |
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("EMBEDDINGS_MODEL_NAME") {
            self.embedding.model = Some(v);
        }
        if let Some(v) = get("PERSIST_DIRECTORY") {
            self.store.persist_directory = PathBuf::from(v);
        }
        if let Some(v) = get("MODEL_TYPE") {
            self.model.model_type = Some(v);
        }
        if let Some(v) = get("MODEL_PATH") {
            self.model.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MODEL_N_CTX") {
            self.model.n_ctx = parse_number("MODEL_N_CTX", &v)?;
        }
        if let Some(v) = get("SOURCE_DIRECTORY") {
            self.ingest.source_directory = PathBuf::from(v);
        }
        if let Some(v) = get("TARGET_SOURCE_CHUNKS") {
            self.retrieval.top_k = parse_number("TARGET_SOURCE_CHUNKS", &v)?;
        }
        if let Some(v) = get("BIND_ADDRESS") {
            self.server.bind = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.chunk_size == 0 {
            return Err(Error::Configuration("ingest.chunk_size must be > 0".into()));
        }
        if self.ingest.chunk_overlap >= self.ingest.chunk_size {
            return Err(Error::Configuration(format!(
                "ingest.chunk_overlap ({}) must be smaller than ingest.chunk_size ({})",
                self.ingest.chunk_overlap, self.ingest.chunk_size
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::Configuration(
                "embedding.batch_size must be > 0".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::Configuration("retrieval.top_k must be >= 1".into()));
        }
        if self.model.n_ctx == 0 {
            return Err(Error::Configuration("model.n_ctx must be > 0".into()));
        }
        if self.model.max_tokens >= self.model.n_ctx {
            return Err(Error::Configuration(format!(
                "model.max_tokens ({}) must be smaller than model.n_ctx ({})",
                self.model.max_tokens, self.model.n_ctx
            )));
        }
        match self.embedding.provider.as_str() {
            "local" | "ollama" | "hashed" => {}
            other => {
                return Err(Error::Configuration(format!(
                    "Unknown embedding provider: '{}'. Must be local, ollama, or hashed.",
                    other
                )))
            }
        }
        if self.embedding.dims == Some(0) {
            return Err(Error::Configuration("embedding.dims must be > 0".into()));
        }
        self.model.model_type()?;
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{} must be a positive integer, got '{}'", key, value)))
}

/// Read `path` if it exists, apply process environment overrides, validate.
pub fn load_config(path: &Path) -> Result<Config> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with environment variables read through `lookup`.
pub fn load_config_with_env<F>(path: &Path, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {}", e)))?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    config.apply_env(lookup)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.ingest.chunk_size, 500);
        assert!(config.model.model_type().unwrap().is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[embedding]
provider = "hashed"
dims = 64

[model]
model_type = "GPT4All"
n_ctx = 2048
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.embedding.dims, Some(64));
        assert_eq!(config.model.n_ctx, 2048);
        assert_eq!(config.model.model_type().unwrap(), Some(ModelType::Gpt4All));
        assert_eq!(config.store.persist_directory, PathBuf::from("db"));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("EMBEDDINGS_MODEL_NAME", "bge-small-en-v1.5"),
                ("PERSIST_DIRECTORY", "/var/lib/rag/db"),
                ("MODEL_TYPE", "LlamaCpp"),
                ("MODEL_N_CTX", "4096"),
                ("TARGET_SOURCE_CHUNKS", "6"),
            ]))
            .unwrap();
        assert_eq!(config.embedding.model.as_deref(), Some("bge-small-en-v1.5"));
        assert_eq!(
            config.store.persist_directory,
            PathBuf::from("/var/lib/rag/db")
        );
        assert_eq!(config.model.model_type().unwrap(), Some(ModelType::LlamaCpp));
        assert_eq!(config.model.n_ctx, 4096);
        assert_eq!(config.retrieval.top_k, 6);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("MODEL_TYPE", "  ")])).unwrap();
        assert!(config.model.model_type.is_none());
    }

    #[test]
    fn non_numeric_context_window_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("MODEL_N_CTX", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn unknown_model_type_fails_validation() {
        let mut config = Config::default();
        config.model.model_type = Some("Falcon".into());
        assert!(matches!(
            config.validate().unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut config = Config::default();
        config.ingest.chunk_overlap = config.ingest.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_embedding_provider_fails_validation() {
        let mut config = Config::default();
        config.embedding.provider = "openai".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let mut model = ModelConfig::default();
        assert_eq!(model.generation_timeout(), Some(Duration::from_secs(300)));
        model.generation_timeout_secs = 0;
        assert_eq!(model.generation_timeout(), None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config_with_env(&tmp.path().join("absent.toml"), env(&[])).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.model.model_type.is_none());
    }
}
