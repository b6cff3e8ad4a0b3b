//! Query orchestration: validate → retrieve → generate.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::generate::{Generator, TokenSink};
use crate::models::Answer;
use crate::retrieve::Retriever;
use crate::store::VectorStore;

pub struct QueryService {
    store: Arc<VectorStore>,
    retriever: Retriever,
    generator: Arc<Generator>,
}

impl QueryService {
    pub fn new(store: Arc<VectorStore>, retriever: Retriever, generator: Arc<Generator>) -> Self {
        Self {
            store,
            retriever,
            generator,
        }
    }

    /// Answer `query` from `collection`, returning only the final result.
    pub async fn answer(&self, query: &str, collection: &str) -> Result<Answer> {
        self.answer_streaming(query, collection, None, &TokenSink::discard())
            .await
    }

    /// Answer `query` from `collection`, pushing tokens to `sink` as they
    /// are generated. `k` overrides the configured number of chunks.
    pub async fn answer_streaming(
        &self,
        query: &str,
        collection: &str,
        k: Option<usize>,
        sink: &TokenSink,
    ) -> Result<Answer> {
        if query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".into()));
        }
        self.store.collection_info(collection).await?;

        let retrieved = self.retriever.retrieve(query, collection, k).await?;
        let chunks: Vec<_> = retrieved.hits.into_iter().map(|h| h.chunk).collect();
        let answer = self.generator.generate(query, &chunks, sink).await?;
        tracing::info!(
            collection,
            retrieved = chunks.len(),
            used = answer.sources.len(),
            "query answered"
        );
        Ok(answer)
    }
}
