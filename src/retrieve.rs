//! Query embedding + nearest-neighbour lookup.

use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::RetrievalResult;
use crate::store::VectorStore;

pub struct Retriever {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    default_k: usize,
}

impl Retriever {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn EmbeddingProvider>, default_k: usize) -> Self {
        Self {
            store,
            embedder,
            default_k,
        }
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    /// Rank `collection`'s chunks against `query`.
    ///
    /// The collection must have been built with the same embedding model the
    /// query is embedded with; scores across models are meaningless, so a
    /// mismatch fails with [`Error::EmbeddingModelMismatch`].
    pub async fn retrieve(
        &self,
        query: &str,
        collection: &str,
        k: Option<usize>,
    ) -> Result<RetrievalResult> {
        let info = self.store.collection_info(collection).await?;
        if info.embedding_model != self.embedder.model_name() {
            return Err(Error::EmbeddingModelMismatch {
                collection: collection.to_string(),
                collection_model: info.embedding_model,
                query_model: self.embedder.model_name().to_string(),
            });
        }

        let vector = self.embedder.embed(query).await?;
        let k = k.unwrap_or(self.default_k);
        let result = self.store.query(collection, &vector, k).await?;
        tracing::debug!(collection, k, hits = result.len(), "retrieved");
        Ok(result)
    }
}
