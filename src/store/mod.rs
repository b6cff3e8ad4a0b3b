//! Collection-partitioned vector store.
//!
//! A [`VectorStore`] owns a persist root with one sub-directory per
//! collection. Collections are independent: each is loaded, written and
//! locked on its own, and one that fails to load is fenced off as
//! [`Error::CorruptCollection`] without affecting the rest.
//!
//! Search is brute-force cosine similarity over the collection's vectors,
//! ranked by descending score with ties broken by ascending chunk id.

mod collection;

pub use collection::{CollectionInfo, ReplaceStats};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{Chunk, RetrievalResult, ScoredChunk};

use collection::{Collection, CollectionMeta};

const MAX_NAME_LEN: usize = 128;

enum Slot {
    Ready(Arc<Collection>),
    Corrupt { path: PathBuf, reason: String },
}

pub struct VectorStore {
    root: PathBuf,
    collections: RwLock<HashMap<String, Slot>>,
}

impl VectorStore {
    /// Open (creating if needed) the persist root and load every collection in it.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut collections = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_collection_name(&name).is_err() {
                continue;
            }
            let path = entry.path();
            match Collection::load(path.clone()).await {
                Ok(c) => {
                    collections.insert(name, Slot::Ready(Arc::new(c)));
                }
                Err(reason) => {
                    tracing::warn!(collection = %name, path = %path.display(), %reason, "collection failed to load");
                    collections.insert(name, Slot::Corrupt { path, reason });
                }
            }
        }

        tracing::info!(root = %root.display(), collections = collections.len(), "vector store opened");
        Ok(Self {
            root,
            collections: RwLock::new(collections),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `name` if absent.
    ///
    /// Idempotent when the existing collection has the same dimension and
    /// embedding model; a different dimension is [`Error::DimensionMismatch`],
    /// a different model [`Error::EmbeddingModelMismatch`].
    pub async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        embedding_model: &str,
    ) -> Result<CollectionInfo> {
        validate_collection_name(name)?;
        if dimension == 0 {
            return Err(Error::InvalidRequest(
                "collection dimension must be > 0".into(),
            ));
        }

        let mut collections = self.collections.write().await;
        if let Some(slot) = collections.get(name) {
            let existing = ready(name, slot)?;
            let meta = existing.meta();
            if meta.dimension != dimension {
                return Err(Error::DimensionMismatch {
                    collection: name.to_string(),
                    expected: meta.dimension,
                    actual: dimension,
                });
            }
            if meta.embedding_model != embedding_model {
                return Err(Error::EmbeddingModelMismatch {
                    collection: name.to_string(),
                    collection_model: meta.embedding_model,
                    query_model: embedding_model.to_string(),
                });
            }
            return Ok(existing.snapshot().info());
        }

        let meta = CollectionMeta {
            name: name.to_string(),
            dimension,
            embedding_model: embedding_model.to_string(),
            created_at: Utc::now(),
        };
        let collection = Collection::create(self.root.join(name), meta).await?;
        let info = collection.snapshot().info();
        collections.insert(name.to_string(), Slot::Ready(Arc::new(collection)));
        tracing::info!(collection = name, dimension, model = embedding_model, "collection created");
        Ok(info)
    }

    /// Write or replace chunks by id. Returns how many were new or changed.
    pub async fn upsert(&self, collection: &str, chunks: Vec<Chunk>) -> Result<usize> {
        self.get(collection).await?.upsert(chunks).await
    }

    /// Make `chunks` the complete set stored for `source` in `collection`.
    pub async fn replace_source(
        &self,
        collection: &str,
        source: &str,
        chunks: Vec<Chunk>,
    ) -> Result<ReplaceStats> {
        let stats = self
            .get(collection)
            .await?
            .replace_source(source, chunks)
            .await?;
        tracing::debug!(
            collection,
            source,
            added = stats.added,
            removed = stats.removed,
            unchanged = stats.unchanged,
            "source replaced"
        );
        Ok(stats)
    }

    /// The `k` chunks most similar to `vector`.
    pub async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<RetrievalResult> {
        let snapshot = self.get(collection).await?.snapshot();
        if vector.len() != snapshot.meta.dimension {
            return Err(Error::DimensionMismatch {
                collection: collection.to_string(),
                expected: snapshot.meta.dimension,
                actual: vector.len(),
            });
        }

        let mut scored: Vec<(f32, &Chunk)> = snapshot
            .chunks
            .values()
            .map(|chunk| {
                let score = cosine_similarity(vector, &chunk.vector);
                (if score.is_nan() { f32::NEG_INFINITY } else { score }, chunk)
            })
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.id.cmp(&b.id)));
        let hits = scored
            .into_iter()
            .take(k)
            .map(|(score, chunk)| ScoredChunk {
                score,
                chunk: chunk.clone(),
            })
            .collect();
        Ok(RetrievalResult { hits })
    }

    /// Sorted names of every collection, including ones that failed to load.
    pub async fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        Ok(self.get(name).await?.snapshot().info())
    }

    /// Remove a collection and its directory.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let slot = self
            .collections
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))?;
        match slot {
            Slot::Ready(c) => c.destroy().await?,
            Slot::Corrupt { path, .. } => match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        tracing::info!(collection = name, "collection deleted");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Arc<Collection>> {
        let collections = self.collections.read().await;
        match collections.get(name) {
            Some(slot) => ready(name, slot),
            None => Err(Error::UnknownCollection(name.to_string())),
        }
    }
}

fn ready(name: &str, slot: &Slot) -> Result<Arc<Collection>> {
    match slot {
        Slot::Ready(c) => Ok(Arc::clone(c)),
        Slot::Corrupt { path, reason } => Err(Error::CorruptCollection {
            name: name.to_string(),
            path: path.clone(),
            reason: reason.clone(),
        }),
    }
}

/// 1–128 characters of `[A-Za-z0-9._-]`, not starting with `.`.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidCollectionName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("name is longer than 128 characters");
    }
    if name.starts_with('.') {
        return invalid("name may not start with '.'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return invalid(&format!("character {:?} is not allowed", c));
    }
    Ok(())
}
