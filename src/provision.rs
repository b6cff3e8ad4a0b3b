//! Model provisioning: model type → local weight file.
//!
//! Each [`ModelType`] maps to one download URL. Artifacts are cached in the
//! models directory under the URL's basename, so a second provisioning of
//! the same type is a no-op. Downloads stream into a hidden `.partial` file
//! and are renamed into place only once complete; a failed download never
//! leaves a file that a later run would mistake for a finished artifact.
//!
//! Provisioning runs once at startup and produces a [`ModelHandle`] that is
//! passed to the generator.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::config::ModelConfig;
use crate::error::{Error, Result};

const LLAMA_CPP_URL: &str =
    "https://huggingface.co/TheBloke/Llama-2-7B-Chat-GGUF/resolve/main/llama-2-7b-chat.Q4_K_M.gguf";
const GPT4ALL_URL: &str = "https://gpt4all.io/models/gguf/mistral-7b-openorca.Q4_0.gguf";

/// Supported generation model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    LlamaCpp,
    Gpt4All,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::LlamaCpp => "LlamaCpp",
            ModelType::Gpt4All => "GPT4All",
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            ModelType::LlamaCpp => LLAMA_CPP_URL,
            ModelType::Gpt4All => GPT4ALL_URL,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llamacpp" | "llama_cpp" => Ok(ModelType::LlamaCpp),
            "gpt4all" => Ok(ModelType::Gpt4All),
            _ => Err(Error::Configuration(format!(
                "Model {} not supported! Expected LlamaCpp or GPT4All.",
                s.trim()
            ))),
        }
    }
}

/// Lifecycle of a model artifact on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    Downloading,
    Ready,
}

/// A ready weight file for one model type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    pub model_type: ModelType,
    pub path: PathBuf,
}

pub struct ModelProvisioner {
    models_dir: PathBuf,
    sources: HashMap<ModelType, String>,
    states: Mutex<HashMap<ModelType, ArtifactState>>,
    client: reqwest::Client,
    progress: bool,
}

impl ModelProvisioner {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        let sources = [ModelType::LlamaCpp, ModelType::Gpt4All]
            .into_iter()
            .map(|t| (t, t.default_url().to_string()))
            .collect();
        Self {
            models_dir: models_dir.into(),
            sources,
            states: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            progress: true,
        }
    }

    /// Fetch `model_type` from `url` instead of its default location.
    pub fn with_source(mut self, model_type: ModelType, url: impl Into<String>) -> Self {
        self.sources.insert(model_type, url.into());
        self
    }

    /// Draw a progress bar while downloading. On by default.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Where the artifact for `model_type` lives once provisioned.
    pub fn artifact_path(&self, model_type: ModelType) -> Result<PathBuf> {
        let url = self.source(model_type)?;
        Ok(self.models_dir.join(url_basename(model_type, url)?))
    }

    pub fn state(&self, model_type: ModelType) -> ArtifactState {
        if let Some(state) = self.lock_states().get(&model_type) {
            return *state;
        }
        match self.artifact_path(model_type) {
            Ok(path) if path.is_file() => ArtifactState::Ready,
            _ => ArtifactState::Absent,
        }
    }

    /// Resolve the configured model to a handle.
    ///
    /// Returns `Ok(None)` when no model type is configured. An explicit
    /// `model_path` must point at an existing file and skips the download.
    pub async fn resolve(&self, config: &ModelConfig) -> Result<Option<ModelHandle>> {
        let Some(model_type) = config.model_type()? else {
            return Ok(None);
        };
        if let Some(path) = &config.model_path {
            if !path.is_file() {
                return Err(Error::provisioning(
                    model_type,
                    format!("model_path {} does not exist", path.display()),
                ));
            }
            self.set_state(model_type, ArtifactState::Ready);
            return Ok(Some(ModelHandle {
                model_type,
                path: path.clone(),
            }));
        }
        self.provision(model_type).await.map(Some)
    }

    /// Ensure the artifact for `model_type` is on disk, downloading it if needed.
    pub async fn provision(&self, model_type: ModelType) -> Result<ModelHandle> {
        let url = self.source(model_type)?.to_string();
        let basename = url_basename(model_type, &url)?;
        let dest = self.models_dir.join(&basename);

        if dest.is_file() {
            tracing::debug!(model = %model_type, path = %dest.display(), "model artifact cached");
            self.set_state(model_type, ArtifactState::Ready);
            return Ok(ModelHandle {
                model_type,
                path: dest,
            });
        }

        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .map_err(|e| {
                Error::provisioning(
                    model_type,
                    format!("create {}: {}", self.models_dir.display(), e),
                )
            })?;

        let partial = self.models_dir.join(format!(".{}.partial", basename));
        self.set_state(model_type, ArtifactState::Downloading);
        tracing::info!(model = %model_type, %url, "downloading model artifact");

        let result = match self.download(&url, &partial).await {
            Ok(bytes) => tokio::fs::rename(&partial, &dest)
                .await
                .map(|_| bytes)
                .map_err(|e| format!("rename into {}: {}", dest.display(), e)),
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                self.set_state(model_type, ArtifactState::Ready);
                tracing::info!(model = %model_type, path = %dest.display(), bytes, "model artifact ready");
                Ok(ModelHandle {
                    model_type,
                    path: dest,
                })
            }
            Err(reason) => {
                let _ = tokio::fs::remove_file(&partial).await;
                self.set_state(model_type, ArtifactState::Absent);
                tracing::error!(model = %model_type, %url, %reason, "model download failed");
                Err(Error::provisioning(model_type, reason))
            }
        }
    }

    async fn download(&self, url: &str, partial: &Path) -> std::result::Result<u64, String> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("download {}: {}", url, e))?;

        let pb = self.progress_bar(resp.content_length());
        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| format!("create {}: {}", partial.display(), e))?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| format!("read body: {}", e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("write {}: {}", partial.display(), e))?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }
        file.flush()
            .await
            .map_err(|e| format!("flush {}: {}", partial.display(), e))?;
        file.sync_all()
            .await
            .map_err(|e| format!("sync {}: {}", partial.display(), e))?;
        pb.finish_and_clear();

        if written == 0 {
            return Err(format!("download {}: empty response body", url));
        }
        Ok(written)
    }

    fn progress_bar(&self, len: Option<u64>) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        match len {
            Some(len) => {
                let pb = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                pb
            }
            None => ProgressBar::new_spinner(),
        }
    }

    fn source(&self, model_type: ModelType) -> Result<&str> {
        self.sources
            .get(&model_type)
            .map(String::as_str)
            .ok_or_else(|| Error::Configuration(format!("no download source for {}", model_type)))
    }

    fn set_state(&self, model_type: ModelType, state: ArtifactState) {
        self.lock_states().insert(model_type, state);
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<ModelType, ArtifactState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Last path segment of `url`, without query or fragment.
fn url_basename(model_type: ModelType, url: &str) -> Result<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::Configuration(format!(
            "download URL for {} has no file name: {}",
            model_type, url
        )));
    }
    Ok(name.to_string())
}
