//! Error taxonomy for the ingestion → retrieval → generation pipeline.
//!
//! Startup errors ([`Error::Configuration`], [`Error::Provisioning`]) are
//! fatal: the process must not begin serving. Everything else is a
//! per-request failure that the caller reports and moves past.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown or missing model type, bad setting, unusable embedder.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Download or cache-write failure while resolving a model artifact.
    #[error("provisioning failed for {model_type}: {reason}")]
    Provisioning { model_type: String, reason: String },

    /// One document could not be read, chunked, or embedded.
    #[error("ingestion of '{document}' failed: {reason}")]
    Ingestion { document: String, reason: String },

    #[error(
        "dimension mismatch for collection '{collection}': expected {expected}, got {actual}"
    )]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown collection: '{0}'")]
    UnknownCollection(String),

    #[error("invalid collection name '{name}': {reason}")]
    InvalidCollectionName { name: String, reason: String },

    #[error("collection '{name}' could not be loaded from {path}: {reason}")]
    CorruptCollection {
        name: String,
        path: PathBuf,
        reason: String,
    },

    #[error(
        "collection '{collection}' was built with embedding model '{collection_model}', \
         but queries are embedded with '{query_model}'"
    )]
    EmbeddingModelMismatch {
        collection: String,
        collection_model: String,
        query_model: String,
    },

    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Generation requested without a usable backend.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generation timed out after {0} seconds")]
    GenerationTimeout(u64),

    /// The consumer of a token stream went away.
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that must abort startup instead of being reported per request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Provisioning { .. })
    }

    pub(crate) fn ingestion(document: &str, reason: impl ToString) -> Self {
        Error::Ingestion {
            document: document.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn provisioning(model_type: impl ToString, reason: impl ToString) -> Self {
        Error::Provisioning {
            model_type: model_type.to_string(),
            reason: reason.to_string(),
        }
    }
}
