//! One persisted collection: metadata, chunks, and their vectors.
//!
//! On disk a collection is a directory holding `collection.json` and
//! `chunks.json`. Both files are written to a temporary name, synced, and
//! renamed into place, so a crash mid-write leaves the previous version.
//!
//! In memory the current contents live behind an `Arc` snapshot. Writers
//! serialise on `write_gate`, build the next snapshot, persist it, then swap
//! it in; readers clone the `Arc` and never observe a half-applied write.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{Chunk, ChunkMetadata};

pub(crate) const META_FILE: &str = "collection.json";
pub(crate) const CHUNKS_FILE: &str = "chunks.json";
const FORMAT_VERSION: u32 = 1;

/// Summary of a collection, as reported by `collection_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    pub embedding_model: String,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CollectionMeta {
    pub name: String,
    pub dimension: usize,
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ChunksFile {
    version: u32,
    chunks: Vec<ChunkRecord>,
}

#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    id: String,
    text: String,
    metadata: ChunkMetadata,
    /// Base64 of little-endian `f32`s.
    vector: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub meta: CollectionMeta,
    pub chunks: BTreeMap<String, Chunk>,
}

impl Snapshot {
    pub fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.meta.name.clone(),
            dimension: self.meta.dimension,
            embedding_model: self.meta.embedding_model.clone(),
            chunk_count: self.chunks.len(),
            created_at: self.meta.created_at,
        }
    }
}

/// Outcome of replacing one source's chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceStats {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

pub(crate) struct Collection {
    dir: PathBuf,
    write_gate: tokio::sync::Mutex<()>,
    current: RwLock<Arc<Snapshot>>,
    dropped: AtomicBool,
}

impl Collection {
    /// Create the directory and persist an empty collection.
    pub async fn create(dir: PathBuf, meta: CollectionMeta) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let snapshot = Snapshot {
            meta,
            chunks: BTreeMap::new(),
        };
        write_meta(&dir, &snapshot.meta).await?;
        write_chunks(&dir, &snapshot).await?;
        Ok(Self::from_snapshot(dir, snapshot))
    }

    /// Load a collection directory. Any parse or consistency failure is
    /// reported as a plain reason string for the caller to wrap.
    pub async fn load(dir: PathBuf) -> std::result::Result<Self, String> {
        let meta_raw = tokio::fs::read(dir.join(META_FILE))
            .await
            .map_err(|e| format!("{}: {}", META_FILE, e))?;
        let meta: CollectionMeta =
            serde_json::from_slice(&meta_raw).map_err(|e| format!("{}: {}", META_FILE, e))?;

        let chunks_raw = tokio::fs::read(dir.join(CHUNKS_FILE))
            .await
            .map_err(|e| format!("{}: {}", CHUNKS_FILE, e))?;
        let file: ChunksFile =
            serde_json::from_slice(&chunks_raw).map_err(|e| format!("{}: {}", CHUNKS_FILE, e))?;
        if file.version != FORMAT_VERSION {
            return Err(format!("unsupported chunks format version {}", file.version));
        }

        let mut chunks = BTreeMap::new();
        for record in file.chunks {
            let bytes = BASE64
                .decode(&record.vector)
                .map_err(|e| format!("chunk {}: bad vector encoding: {}", record.id, e))?;
            if bytes.len() != meta.dimension * 4 {
                return Err(format!(
                    "chunk {}: vector has {} bytes, expected {}",
                    record.id,
                    bytes.len(),
                    meta.dimension * 4
                ));
            }
            let chunk = Chunk {
                id: record.id,
                text: record.text,
                metadata: record.metadata,
                vector: blob_to_vec(&bytes),
            };
            chunks.insert(chunk.id.clone(), chunk);
        }

        Ok(Self::from_snapshot(dir, Snapshot { meta, chunks }))
    }

    fn from_snapshot(dir: PathBuf, snapshot: Snapshot) -> Self {
        Self {
            dir,
            write_gate: tokio::sync::Mutex::new(()),
            current: RwLock::new(Arc::new(snapshot)),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn meta(&self) -> CollectionMeta {
        self.snapshot().meta.clone()
    }

    /// Write or replace chunks by id.
    pub async fn upsert(&self, chunks: Vec<Chunk>) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let base = self.snapshot();
        self.ensure_live(&base.meta.name)?;
        check_dimensions(&base.meta, &chunks)?;

        let mut next = (*base).clone();
        let mut changed = 0;
        for chunk in chunks {
            if next.chunks.get(&chunk.id) != Some(&chunk) {
                changed += 1;
            }
            next.chunks.insert(chunk.id.clone(), chunk);
        }
        if changed > 0 {
            self.commit(next).await?;
        }
        Ok(changed)
    }

    /// Make `chunks` the complete set of chunks for `source`.
    pub async fn replace_source(&self, source: &str, chunks: Vec<Chunk>) -> Result<ReplaceStats> {
        let _gate = self.write_gate.lock().await;
        let base = self.snapshot();
        self.ensure_live(&base.meta.name)?;
        check_dimensions(&base.meta, &chunks)?;

        let keep: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = base
            .chunks
            .values()
            .filter(|c| c.metadata.source == source && !keep.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();

        let mut stats = ReplaceStats {
            removed: stale.len(),
            ..ReplaceStats::default()
        };
        let mut next = (*base).clone();
        for id in &stale {
            next.chunks.remove(id);
        }
        for chunk in chunks {
            if next.chunks.get(&chunk.id) == Some(&chunk) {
                stats.unchanged += 1;
            } else {
                stats.added += 1;
                next.chunks.insert(chunk.id.clone(), chunk);
            }
        }

        if stats.added > 0 || stats.removed > 0 {
            self.commit(next).await?;
        }
        Ok(stats)
    }

    /// Mark dropped and remove the directory. Waits for an in-flight write.
    pub async fn destroy(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.dropped.store(true, Ordering::SeqCst);
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_live(&self, name: &str) -> Result<()> {
        if self.dropped.load(Ordering::SeqCst) {
            return Err(Error::UnknownCollection(name.to_string()));
        }
        Ok(())
    }

    async fn commit(&self, next: Snapshot) -> Result<()> {
        write_chunks(&self.dir, &next).await?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        Ok(())
    }
}

fn check_dimensions(meta: &CollectionMeta, chunks: &[Chunk]) -> Result<()> {
    match chunks.iter().find(|c| c.vector.len() != meta.dimension) {
        Some(bad) => Err(Error::DimensionMismatch {
            collection: meta.name.clone(),
            expected: meta.dimension,
            actual: bad.vector.len(),
        }),
        None => Ok(()),
    }
}

async fn write_meta(dir: &Path, meta: &CollectionMeta) -> Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    write_atomic(&dir.join(META_FILE), &json).await
}

async fn write_chunks(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let file = ChunksFile {
        version: FORMAT_VERSION,
        chunks: snapshot
            .chunks
            .values()
            .map(|c| ChunkRecord {
                id: c.id.clone(),
                text: c.text.clone(),
                metadata: c.metadata.clone(),
                vector: BASE64.encode(vec_to_blob(&c.vector)),
            })
            .collect(),
    };
    let json = serde_json::to_vec(&file)?;
    write_atomic(&dir.join(CHUNKS_FILE), &json).await
}

/// Write to a hidden sibling temp file, sync, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}
