//! End-to-end ingestion → retrieval → generation, without network or model
//! weights: the `hashed` embedder plus a scripted backend that answers by
//! quoting its context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ragloom::app::{load_generator, App};
use ragloom::config::Config;
use ragloom::embedding::{EmbeddingProvider, HashedProvider};
use ragloom::generate::{estimate_tokens, GenerationBackend, Generator, PromptTemplate, TokenSink};
use ragloom::models::Document;
use ragloom::provision::ModelType;
use ragloom::store::VectorStore;
use ragloom::{Error, Result};

const DIMS: usize = 64;

// ─── Helpers ────────────────────────────────────────────────────────

/// Answers "From the context: <first context passage>", one word per token,
/// and remembers the last prompt it saw.
struct ContextEcho {
    window: usize,
    last_prompt: Mutex<Option<String>>,
}

impl ContextEcho {
    fn new(window: usize) -> Arc<Self> {
        Arc::new(Self {
            window,
            last_prompt: Mutex::new(None),
        })
    }

    fn last_prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl GenerationBackend for ContextEcho {
    fn name(&self) -> &str {
        "context-echo"
    }

    fn context_window(&self) -> usize {
        self.window
    }

    fn template(&self) -> PromptTemplate {
        PromptTemplate::Plain
    }

    async fn generate(&self, prompt: &str, sink: &TokenSink) -> Result<String> {
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());

        // Plain layout: instructions, blank line, context passages, blank line, question.
        let before_question = prompt.split("\n\nQuestion:").next().unwrap_or_default();
        let context = before_question
            .split("\n\n")
            .nth(1)
            .unwrap_or_default()
            .trim();
        let answer = format!("From the context: {}", context);

        let mut out = String::new();
        for piece in answer.split_inclusive(' ') {
            sink.emit(piece).await?;
            out.push_str(piece);
        }
        Ok(out)
    }
}

/// Works through `total` steps on a blocking thread, checking for
/// cancellation before each one, and counts the steps it finished.
struct BlockingSteps {
    done: Arc<AtomicUsize>,
    total: usize,
}

#[async_trait]
impl GenerationBackend for BlockingSteps {
    fn name(&self) -> &str {
        "blocking-steps"
    }

    fn context_window(&self) -> usize {
        1000
    }

    fn template(&self) -> PromptTemplate {
        PromptTemplate::Plain
    }

    async fn generate(&self, _prompt: &str, sink: &TokenSink) -> Result<String> {
        let sink = sink.clone();
        let done = Arc::clone(&self.done);
        let total = self.total;
        tokio::task::spawn_blocking(move || {
            for _ in 0..total {
                if sink.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
                sink.blocking_emit("step ")?;
            }
            Ok("finished".to_string())
        })
        .await
        .map_err(|e| Error::Generation(e.to_string()))?
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.embedding.provider = "hashed".to_string();
    cfg.embedding.dims = Some(DIMS);
    cfg.store.persist_directory = tmp.path().join("db");
    cfg.ingest.source_directory = tmp.path().join("source_documents");
    cfg.model.models_directory = tmp.path().join("models");
    cfg
}

async fn test_app(tmp: &TempDir, generator: Generator) -> App {
    let cfg = test_config(tmp);
    let store = Arc::new(VectorStore::open(&cfg.store.persist_directory).await.unwrap());
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashedProvider::with_dims("hashed-v1", DIMS));
    App::assemble(cfg, store, embedder, generator)
}

async fn app_with_echo(tmp: &TempDir, window: usize) -> (App, Arc<ContextEcho>) {
    let backend = ContextEcho::new(window);
    let model = test_config(tmp).model;
    let generator = Generator::new(backend.clone(), &model);
    (test_app(tmp, generator).await, backend)
}

fn doc(name: &str, text: &str) -> Document {
    Document::new(name, text.as_bytes().to_vec())
}

/// Paragraphs long enough to land in separate chunks, each about a
/// different colour so queries spread across them.
fn long_document() -> String {
    let colours = [
        "red", "orange", "yellow", "green", "blue", "indigo", "violet", "black", "white", "grey",
        "brown", "pink",
    ];
    colours
        .iter()
        .map(|c| {
            format!(
                "The {c} paragraph talks about colour and light. {}",
                format!("Things that are {c} appear {c} in daylight. ").repeat(8)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_single_fact_is_answered_with_its_source() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;

    let ids = app
        .ingestor
        .ingest(&doc("sky.txt", "The sky is blue."), "t1")
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let answer = app.query.answer("What color is the sky?", "t1").await.unwrap();
    assert!(answer.text.contains("blue"), "answer was {:?}", answer.text);
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].metadata.source, "sky.txt");
    assert_eq!(answer.sources[0].id, ids[0]);
}

#[tokio::test]
async fn scenario_unknown_collection_fails_without_tokens() {
    let tmp = TempDir::new().unwrap();
    let (app, backend) = app_with_echo(&tmp, 1000).await;

    let (sink, mut tokens) = TokenSink::channel(8, CancellationToken::new());
    let err = app
        .query
        .answer_streaming("anything?", "never-ingested", None, &sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCollection(ref name) if name == "never-ingested"));
    drop(sink);
    assert!(tokens.recv().await.is_none());
    assert!(backend.last_prompt().is_empty());
}

#[tokio::test]
async fn scenario_one_collection_per_file_without_a_name() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;

    let outcomes = app
        .ingestor
        .ingest_batch(
            vec![
                doc("alpha.txt", "Alpha talks about rivers."),
                doc("beta.md", "# Beta\n\nBeta talks about mountains."),
            ],
            None,
        )
        .await;
    assert!(outcomes.iter().all(|o| o.is_ok()), "{:?}", outcomes);
    assert_eq!(outcomes[0].collection, "alpha.txt");
    assert_eq!(outcomes[1].collection, "beta.md");

    let names = app.store.list_collections().await;
    assert_eq!(names, vec!["alpha.txt".to_string(), "beta.md".to_string()]);

    let alpha = app.query.answer("rivers", "alpha.txt").await.unwrap();
    assert!(alpha.sources.iter().all(|c| c.metadata.source == "alpha.txt"));
}

// ─── Properties ─────────────────────────────────────────────────────

#[tokio::test]
async fn ingesting_twice_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;
    let text = long_document();

    let first = app.ingestor.ingest(&doc("colours.md", &text), "c").await.unwrap();
    let before = app.store.collection_info("c").await.unwrap();
    let hits_before = app.query.answer("which things are green", "c").await.unwrap();

    let second = app.ingestor.ingest(&doc("colours.md", &text), "c").await.unwrap();
    let after = app.store.collection_info("c").await.unwrap();
    let hits_after = app.query.answer("which things are green", "c").await.unwrap();

    assert!(first.len() > 1);
    assert_eq!(first, second);
    assert_eq!(before.chunk_count, after.chunk_count);
    assert_eq!(after.chunk_count, first.len());
    assert_eq!(hits_before.sources, hits_after.sources);
}

#[tokio::test]
async fn retrieval_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;
    app.ingestor
        .ingest(&doc("colours.md", &long_document()), "c")
        .await
        .unwrap();
    // Identical texts from two sources tie on score; order falls back to id.
    app.ingestor.ingest(&doc("a.txt", "Twin sentence."), "c").await.unwrap();
    app.ingestor.ingest(&doc("b.txt", "Twin sentence."), "c").await.unwrap();

    let embedder = HashedProvider::with_dims("hashed-v1", DIMS);
    let q = embedder.embed_one("twin sentence about blue");
    let one = app.store.query("c", &q, 6).await.unwrap();
    let two = app.store.query("c", &q, 6).await.unwrap();
    assert_eq!(one, two);
    assert_eq!(one.len(), 6);

    let twins: Vec<&str> = one
        .hits
        .iter()
        .filter(|h| h.chunk.text == "Twin sentence.")
        .map(|h| h.chunk.id.as_str())
        .collect();
    assert_eq!(twins.len(), 2);
    assert!(twins[0] < twins[1]);
}

#[tokio::test]
async fn dimension_conflicts_are_refused() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;
    app.store.create_collection("fixed", DIMS, "hashed-v1").await.unwrap();

    let err = app
        .store
        .create_collection("fixed", DIMS / 2, "hashed-v1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch { expected, actual, .. } if expected == DIMS && actual == DIMS / 2
    ));

    // An ingestor embedding at a different width cannot write into it either.
    let cfg = test_config(&tmp);
    let narrow = ragloom::ingest::Ingestor::new(
        &cfg,
        Arc::clone(&app.store),
        Arc::new(HashedProvider::with_dims("hashed-v1", DIMS / 2)),
    );
    assert!(narrow.ingest(&doc("n.txt", "narrow vectors"), "fixed").await.is_err());
    let info = app.store.collection_info("fixed").await.unwrap();
    assert_eq!(info.dimension, DIMS);
    assert_eq!(info.chunk_count, 0);
}

#[tokio::test]
async fn one_bad_file_does_not_sink_the_batch() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;

    let outcomes = app
        .ingestor
        .ingest_batch(
            vec![
                doc("good.txt", "Good documents are stored."),
                Document::new("bad.txt", vec![0xff, 0xfe, 0x00, 0x41]),
                doc("image.bin", "not a supported type"),
                doc("also-good.md", "Also stored."),
            ],
            Some("mixed"),
        )
        .await;

    let status: Vec<bool> = outcomes.iter().map(|o| o.is_ok()).collect();
    assert_eq!(status, vec![true, false, false, true]);
    assert!(outcomes[1].error.as_deref().unwrap().contains("bad.txt"));

    let info = app.store.collection_info("mixed").await.unwrap();
    let stored: usize = outcomes.iter().map(|o| o.chunk_ids.len()).sum();
    assert_eq!(info.chunk_count, stored);

    // Failed uploads stay staged; successful ones are cleaned up.
    let mut staged: Vec<String> = std::fs::read_dir(tmp.path().join("source_documents"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    staged.sort();
    assert_eq!(staged.len(), 2);
    assert!(staged.iter().any(|n| n.ends_with("-bad.txt")));
    assert!(staged.iter().any(|n| n.ends_with("-image.bin")));
}

#[tokio::test]
async fn prompt_stays_within_the_context_window() {
    let tmp = TempDir::new().unwrap();
    let window = 600;
    let (app, backend) = app_with_echo(&tmp, window).await;
    let max_tokens = test_config(&tmp).model.max_tokens;
    let budget = window - max_tokens;

    app.ingestor
        .ingest(&doc("colours.md", &long_document()), "c")
        .await
        .unwrap();
    let ranked = app
        .query
        .answer_streaming("colour light daylight", "c", Some(10), &TokenSink::discard())
        .await
        .unwrap();

    let prompt = backend.last_prompt();
    assert!(estimate_tokens(&prompt) <= budget, "{} > {}", estimate_tokens(&prompt), budget);
    assert!(!ranked.sources.is_empty());
    assert!(ranked.sources.len() < 10);

    // Kept chunks are the top of the ranking, in order.
    let embedder = HashedProvider::with_dims("hashed-v1", DIMS);
    let full = app
        .store
        .query("c", &embedder.embed_one("colour light daylight"), 10)
        .await
        .unwrap();
    let kept: Vec<&str> = ranked.sources.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(kept, full.ids()[..kept.len()].to_vec());
}

#[tokio::test]
async fn tokens_stream_before_the_answer_returns() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;
    app.ingestor
        .ingest(&doc("sky.txt", "The sky is blue."), "t1")
        .await
        .unwrap();

    let (sink, mut tokens) = TokenSink::channel(64, CancellationToken::new());
    let answer = app
        .query
        .answer_streaming("sky colour", "t1", None, &sink)
        .await
        .unwrap();
    drop(sink);

    let mut streamed = String::new();
    while let Some(token) = tokens.recv().await {
        streamed.push_str(&token);
    }
    assert_eq!(streamed, answer.text);
}

#[tokio::test]
async fn unconfigured_model_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let generator = load_generator(&cfg, false).await.unwrap();
    assert!(!generator.is_ready());

    let app = App::open(cfg, generator).await.unwrap();
    app.ingestor
        .ingest(&doc("sky.txt", "The sky is blue."), "t1")
        .await
        .unwrap();

    let (sink, mut tokens) = TokenSink::channel(8, CancellationToken::new());
    let err = app
        .query
        .answer_streaming("What color is the sky?", "t1", None, &sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedModel(_)));
    drop(sink);
    assert!(tokens.recv().await.is_none());
}

#[test]
fn unknown_model_type_is_a_configuration_error() {
    let err = "Falcon".parse::<ModelType>().unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.is_fatal());

    let mut cfg = Config::default();
    cfg.model.model_type = Some("Falcon".into());
    assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
}

#[tokio::test]
async fn reingesting_a_source_replaces_its_chunks() {
    let tmp = TempDir::new().unwrap();
    let (app, _) = app_with_echo(&tmp, 1000).await;

    app.ingestor
        .ingest(&doc("notes.txt", "Old notes mention turnips."), "c")
        .await
        .unwrap();
    app.ingestor
        .ingest(&doc("notes.txt", "New notes mention parsnips."), "c")
        .await
        .unwrap();

    let info = app.store.collection_info("c").await.unwrap();
    assert_eq!(info.chunk_count, 1);
    let answer = app.query.answer("turnips", "c").await.unwrap();
    assert!(answer.sources.iter().all(|c| !c.text.contains("turnips")));
}

#[tokio::test]
async fn collections_survive_a_restart() {
    let tmp = TempDir::new().unwrap();
    let ids = {
        let (app, _) = app_with_echo(&tmp, 1000).await;
        app.ingestor
            .ingest(&doc("colours.md", &long_document()), "c")
            .await
            .unwrap()
    };

    let (app, _) = app_with_echo(&tmp, 1000).await;
    let info = app.store.collection_info("c").await.unwrap();
    assert_eq!(info.chunk_count, ids.len());
    assert_eq!(info.dimension, DIMS);
    assert_eq!(info.embedding_model, "hashed-v1");

    let answer = app.query.answer("things that are violet", "c").await.unwrap();
    assert!(answer.sources[0].text.contains("violet"));
}

#[tokio::test]
async fn abandoned_answer_stops_a_blocking_backend() {
    let tmp = TempDir::new().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(BlockingSteps {
        done: Arc::clone(&done),
        total: 20,
    });
    let generator = Generator::new(backend, &test_config(&tmp).model);
    let app = Arc::new(test_app(&tmp, generator).await);
    app.ingestor
        .ingest(&doc("sky.txt", "The sky is blue."), "t1")
        .await
        .unwrap();

    let running = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.query.answer("sky?", "t1").await })
    };
    for _ in 0..100 {
        if done.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    running.abort();
    let _ = running.await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_abort = done.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(done.load(Ordering::SeqCst), after_abort);
    assert!(after_abort < 20, "backend ran to completion");

    // The lock is free again and the next answer completes.
    let answer = tokio::time::timeout(Duration::from_secs(5), app.query.answer("sky?", "t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer.text, "finished");
}
