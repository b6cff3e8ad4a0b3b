//! Document ingestion: extract → chunk → embed → store.
//!
//! Each document is processed on its own. A failure (unreadable bytes,
//! embedding error, dimension conflict) is recorded in that document's
//! [`IngestOutcome`] and the batch moves on to the next one.
//!
//! Uploads are staged in the source directory while they are processed and
//! removed once their chunks are stored. Files whose ingestion fails stay
//! staged for inspection.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{chunk_text, ChunkPolicy};
use crate::config::Config;
use crate::embedding::{embed_texts, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::extract::{extract_text, is_supported};
use crate::models::{Chunk, Document};
use crate::store::VectorStore;

/// Per-document result of a batch ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document: String,
    pub collection: String,
    pub chunk_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Ingestor {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    policy: ChunkPolicy,
    batch_size: usize,
    staging_dir: PathBuf,
    max_file_bytes: usize,
}

impl Ingestor {
    pub fn new(
        config: &Config,
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            embedder,
            policy: ChunkPolicy {
                chunk_size: config.ingest.chunk_size,
                overlap: config.ingest.chunk_overlap,
            },
            batch_size: config.embedding.batch_size,
            staging_dir: config.ingest.source_directory.clone(),
            max_file_bytes: config.ingest.max_file_bytes,
        }
    }

    /// Ingest one document into `collection`, creating it if needed.
    ///
    /// Returns the ids of every chunk now stored for this document. Running
    /// it again on unchanged content returns the same ids and leaves the
    /// collection untouched.
    pub async fn ingest(&self, document: &Document, collection: &str) -> Result<Vec<String>> {
        let source = source_name(&document.name)?;
        if document.content.len() > self.max_file_bytes {
            return Err(Error::ingestion(
                &source,
                format!(
                    "{} bytes exceeds the {} byte limit",
                    document.content.len(),
                    self.max_file_bytes
                ),
            ));
        }

        let name = source.clone();
        let bytes = document.content.clone();
        let text = tokio::task::spawn_blocking(move || extract_text(&name, &bytes))
            .await
            .map_err(|e| Error::ingestion(&source, e))?
            .map_err(|e| Error::ingestion(&source, e))?;

        let pieces = chunk_text(&source, &text, &self.policy);
        if pieces.is_empty() {
            return Err(Error::ingestion(&source, "no extractable text"));
        }

        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let vectors = embed_texts(self.embedder.as_ref(), &texts, self.batch_size)
            .await
            .map_err(|e| Error::ingestion(&source, e))?;

        self.store
            .create_collection(collection, self.embedder.dims(), self.embedder.model_name())
            .await?;

        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .zip(vectors)
            .map(|(piece, vector)| Chunk::from_text(piece, vector))
            .collect();
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();

        let stats = self.store.replace_source(collection, &source, chunks).await?;
        tracing::info!(
            document = %source,
            collection,
            chunks = ids.len(),
            added = stats.added,
            removed = stats.removed,
            "document ingested"
        );
        Ok(ids)
    }

    /// Stage and ingest each document.
    ///
    /// With `collection` unset, every document goes into a collection named
    /// after its own file name. A second document with the same source name
    /// and target collection is refused rather than replacing the first.
    pub async fn ingest_batch(
        &self,
        documents: Vec<Document>,
        collection: Option<&str>,
    ) -> Vec<IngestOutcome> {
        let mut outcomes = Vec::with_capacity(documents.len());
        let mut seen = HashSet::new();
        for document in documents {
            let source = source_name(&document.name);
            let target = match collection {
                Some(name) => name.to_string(),
                None => source
                    .as_deref()
                    .map(file_name_of)
                    .unwrap_or_else(|_| document.name.clone()),
            };
            let result = match &source {
                Ok(source) if !seen.insert((target.clone(), source.clone())) => {
                    Err(Error::ingestion(
                        source,
                        "duplicate document name; an earlier file in this batch has the same name",
                    ))
                }
                _ => self.ingest_staged(&document, &target).await,
            };
            outcomes.push(match result {
                Ok(chunk_ids) => IngestOutcome {
                    document: document.name,
                    collection: target,
                    chunk_ids,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(document = %document.name, collection = %target, error = %e, "ingestion failed");
                    IngestOutcome {
                        document: document.name,
                        collection: target,
                        chunk_ids: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            });
        }
        outcomes
    }

    async fn ingest_staged(&self, document: &Document, collection: &str) -> Result<Vec<String>> {
        let staged = self.stage(document).await?;
        let ids = self.ingest(document, collection).await?;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            tracing::warn!(path = %staged.display(), error = %e, "could not remove staged upload");
        }
        Ok(ids)
    }

    async fn stage(&self, document: &Document) -> Result<PathBuf> {
        let source = source_name(&document.name)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let path = self
            .staging_dir
            .join(format!("{}-{}", Uuid::new_v4().simple(), file_name_of(&source)));
        tokio::fs::write(&path, &document.content).await?;
        Ok(path)
    }
}

/// Normalised relative path of a document name, `/`-separated. Root and
/// `.` components are dropped; names that climb with `..` or end up empty
/// are rejected.
fn source_name(name: &str) -> Result<String> {
    let mut parts = Vec::new();
    let normalized = name.replace('\\', "/");
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) if !part.trim().is_empty() => parts.push(part),
                _ => return Err(Error::ingestion(name, "invalid file name")),
            },
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => return Err(Error::ingestion(name, "invalid file name")),
        }
    }
    if parts.is_empty() {
        return Err(Error::ingestion(name, "invalid file name"));
    }
    Ok(parts.join("/"))
}

fn file_name_of(source: &str) -> String {
    source.rsplit('/').next().unwrap_or(source).to_string()
}

/// Read files from disk, descending into directories for supported types.
///
/// Files found under a directory are named by their path relative to it, so
/// `a/notes.txt` and `b/notes.txt` stay distinct sources. Unreadable paths
/// are returned as errors alongside the documents that could be read.
pub fn load_documents(paths: &[PathBuf]) -> (Vec<Document>, Vec<Error>) {
    let mut documents = Vec::new();
    let mut errors = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        let file_name = entry.file_name().to_string_lossy();
                        if is_supported(&file_name) && !file_name.starts_with('.') {
                            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
                            push_file(entry.path(), relative, &mut documents, &mut errors);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(Error::ingestion(&path.display().to_string(), e)),
                }
            }
        } else {
            let name = path.file_name().map(Path::new).unwrap_or(path.as_path());
            push_file(path, name, &mut documents, &mut errors);
        }
    }
    (documents, errors)
}

fn push_file(path: &Path, name: &Path, documents: &mut Vec<Document>, errors: &mut Vec<Error>) {
    let name = name
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    match std::fs::read(path) {
        Ok(bytes) => documents.push(Document::new(name, bytes)),
        Err(e) => errors.push(Error::ingestion(&path.display().to_string(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedProvider;
    use tempfile::TempDir;

    async fn ingestor(tmp: &TempDir) -> Ingestor {
        let mut config = Config::default();
        config.ingest.source_directory = tmp.path().join("staging");
        config.ingest.chunk_size = 64;
        config.ingest.chunk_overlap = 8;
        config.ingest.max_file_bytes = 1024;
        let store = Arc::new(VectorStore::open(tmp.path().join("db")).await.unwrap());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashedProvider::with_dims("hashed-v1", 32));
        Ingestor::new(&config, store, embedder)
    }

    #[test]
    fn source_names_keep_relative_paths() {
        assert_eq!(source_name("a/b/notes.txt").unwrap(), "a/b/notes.txt");
        assert_eq!(source_name("/a/./notes.txt").unwrap(), "a/notes.txt");
        assert_eq!(source_name("a\\notes.txt").unwrap(), "a/notes.txt");
        assert_eq!(source_name("notes.txt").unwrap(), "notes.txt");
        assert_eq!(file_name_of("a/b/notes.txt"), "notes.txt");
        assert!(source_name("").is_err());
        assert!(source_name("dir/..").is_err());
        assert!(source_name("../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn oversize_document_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let ing = ingestor(&tmp).await;
        let doc = Document::new("big.txt", vec![b'a'; 2048]);
        let err = ing.ingest(&doc, "c").await.unwrap_err();
        assert!(matches!(err, Error::Ingestion { .. }));
    }

    #[tokio::test]
    async fn blank_document_is_an_ingestion_error() {
        let tmp = TempDir::new().unwrap();
        let ing = ingestor(&tmp).await;
        let err = ing.ingest(&Document::new("e.txt", "  \n "), "c").await.unwrap_err();
        assert!(matches!(err, Error::Ingestion { .. }));
        assert!(ing.store.list_collections().await.is_empty());
    }

    #[tokio::test]
    async fn staged_file_removed_after_success_and_kept_on_failure() {
        let tmp = TempDir::new().unwrap();
        let ing = ingestor(&tmp).await;
        let outcomes = ing
            .ingest_batch(
                vec![
                    Document::new("ok.txt", "The sky is blue."),
                    Document::new("bad.txt", vec![0xFF, 0xFE, 0x00]),
                ],
                Some("c"),
            )
            .await;
        assert!(outcomes[0].is_ok());
        assert!(!outcomes[1].is_ok());

        let staged: Vec<String> = std::fs::read_dir(tmp.path().join("staging"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(staged.len(), 1);
        assert!(staged[0].ends_with("-bad.txt"));
    }

    #[test]
    fn load_documents_walks_directories() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("nested")).unwrap();
        std::fs::write(docs.join("a.txt"), "alpha").unwrap();
        std::fs::write(docs.join("nested").join("b.md"), "beta").unwrap();
        std::fs::write(docs.join("image.png"), [0u8; 4]).unwrap();

        let (found, errors) = load_documents(&[docs, tmp.path().join("missing.txt")]);
        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "nested/b.md"]);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn same_file_name_in_different_folders_are_separate_sources() {
        let tmp = TempDir::new().unwrap();
        let ing = ingestor(&tmp).await;
        let outcomes = ing
            .ingest_batch(
                vec![
                    Document::new("team-a/notes.txt", "Team A ships the parser."),
                    Document::new("team-b/notes.txt", "Team B owns the scheduler."),
                ],
                Some("c"),
            )
            .await;
        assert!(outcomes.iter().all(|o| o.is_ok()), "{:?}", outcomes);
        assert_eq!(ing.store.collection_info("c").await.unwrap().chunk_count, 2);
    }

    #[tokio::test]
    async fn duplicate_name_in_one_batch_is_refused() {
        let tmp = TempDir::new().unwrap();
        let ing = ingestor(&tmp).await;
        let outcomes = ing
            .ingest_batch(
                vec![
                    Document::new("notes.txt", "The first notes."),
                    Document::new("notes.txt", "Different second notes."),
                ],
                Some("c"),
            )
            .await;
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].error.as_deref().unwrap().contains("duplicate"));
        assert_eq!(ing.store.collection_info("c").await.unwrap().chunk_count, 1);
    }

    #[tokio::test]
    async fn default_collection_uses_the_bare_file_name() {
        let tmp = TempDir::new().unwrap();
        let ing = ingestor(&tmp).await;
        let outcomes = ing
            .ingest_batch(vec![Document::new("reports/q1.md", "Quarter one.")], None)
            .await;
        assert!(outcomes[0].is_ok(), "{:?}", outcomes);
        assert_eq!(outcomes[0].collection, "q1.md");
    }
}
