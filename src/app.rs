//! Component wiring shared by the CLI, the HTTP server and tests.
//!
//! Startup order is fixed: provision the model, load the backend, open the
//! store, self-check the embedder. Any failure before the first request is
//! fatal.

use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{create_provider, self_check, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::ingest::Ingestor;
use crate::provision::ModelProvisioner;
use crate::query::QueryService;
use crate::retrieve::Retriever;
use crate::store::VectorStore;

/// Every long-lived component of a running instance.
pub struct App {
    pub config: Config,
    pub store: Arc<VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub ingestor: Ingestor,
    pub query: QueryService,
}

impl App {
    /// Open the store and the configured embedder, then wire `generator` in.
    pub async fn open(config: Config, generator: Generator) -> Result<Self> {
        let store = Arc::new(VectorStore::open(&config.store.persist_directory).await?);
        let embedder = create_provider(&config.embedding)?;
        self_check(embedder.as_ref()).await?;
        Ok(Self::assemble(config, store, embedder, generator))
    }

    /// Wire already-built parts together.
    pub fn assemble(
        config: Config,
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Generator,
    ) -> Self {
        let ingestor = Ingestor::new(&config, Arc::clone(&store), Arc::clone(&embedder));
        let retriever = Retriever::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.retrieval.top_k,
        );
        let query = QueryService::new(Arc::clone(&store), retriever, Arc::new(generator));
        Self {
            config,
            store,
            embedder,
            ingestor,
            query,
        }
    }
}

/// Provision the configured model and load its backend.
///
/// Blocks until the artifact is on disk. With no model type configured the
/// generator is built without a backend and every query fails with
/// [`Error::UnsupportedModel`].
pub async fn load_generator(config: &Config, progress: bool) -> Result<Generator> {
    let provisioner =
        ModelProvisioner::new(&config.model.models_directory).with_progress(progress);
    let handle = provisioner.resolve(&config.model).await?;

    let model_config = config.model.clone();
    tokio::task::spawn_blocking(move || Generator::from_handle(handle.as_ref(), &model_config))
        .await
        .map_err(|e| Error::Configuration(format!("model loader task failed: {}", e)))?
}
