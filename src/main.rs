//! # ragloom CLI
//!
//! ```bash
//! ragloom --config ./ragloom.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragloom serve` | Provision the model, open the store and serve HTTP |
//! | `ragloom provision` | Download the configured model and print its path |
//! | `ragloom embed <PATHS>...` | Ingest files or directories |
//! | `ragloom ask "<query>" --collection <name>` | Answer a question, streaming tokens |
//! | `ragloom collections` | List collections |
//! | `ragloom drop <name>` | Delete a collection |
//!
//! Settings come from the TOML file, then `.env` / process environment
//! (`MODEL_TYPE`, `PERSIST_DIRECTORY`, ...) on top.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ragloom::app::{load_generator, App};
use ragloom::config::{self, Config};
use ragloom::generate::{Generator, TokenSink};
use ragloom::ingest::load_documents;
use ragloom::provision::ModelProvisioner;
use ragloom::store::VectorStore;
use ragloom::{logging, server};

/// ragloom: ask questions about your documents with a local model.
#[derive(Parser)]
#[command(name = "ragloom", version)]
struct Cli {
    /// Path to the configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "./ragloom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the model, open the store and start the HTTP server.
    Serve,

    /// Download the configured model artifact if it is not cached yet.
    Provision,

    /// Ingest files into a collection.
    ///
    /// Directories are walked for supported file types. Without
    /// `--collection`, every file gets a collection named after itself.
    Embed {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Target collection.
        #[arg(long)]
        collection: Option<String>,
    },

    /// Answer a question from a collection. Tokens stream to stdout.
    Ask {
        query: String,

        #[arg(long)]
        collection: String,

        /// Number of chunks to retrieve (defaults to `retrieval.top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// List collections.
    Collections,

    /// Delete a collection and its data.
    Drop { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init_with_config(&cfg.logging);

    match cli.command {
        Commands::Serve => serve(cfg).await?,
        Commands::Provision => provision(&cfg).await?,
        Commands::Embed { paths, collection } => embed(cfg, &paths, collection.as_deref()).await?,
        Commands::Ask {
            query,
            collection,
            k,
        } => ask(cfg, &query, &collection, k).await?,
        Commands::Collections => list_collections(&cfg).await?,
        Commands::Drop { name } => {
            let store = VectorStore::open(&cfg.store.persist_directory).await?;
            store.delete_collection(&name).await?;
            println!("Dropped collection {}", name);
        }
    }
    Ok(())
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    let generator = load_generator(&cfg, true)
        .await
        .context("model provisioning failed")?;
    if let Some(name) = generator.backend_name() {
        println!("Generation backend: {}", name);
    } else {
        println!("No generation backend loaded; /retrieve will answer 501");
    }
    let app = App::open(cfg, generator)
        .await
        .context("startup failed")?;
    server::run_server(Arc::new(app)).await
}

async fn provision(cfg: &Config) -> anyhow::Result<()> {
    let provisioner = ModelProvisioner::new(&cfg.model.models_directory);
    match provisioner.resolve(&cfg.model).await? {
        Some(handle) => println!("{} ready at {}", handle.model_type, handle.path.display()),
        None => bail!("no model type configured (set model.model_type or MODEL_TYPE)"),
    }
    Ok(())
}

async fn embed(cfg: Config, paths: &[PathBuf], collection: Option<&str>) -> anyhow::Result<()> {
    let (documents, read_errors) = load_documents(paths);
    for err in &read_errors {
        eprintln!("  skipped: {}", err);
    }
    if documents.is_empty() {
        bail!("no supported documents found");
    }

    let app = App::open(cfg, Generator::unsupported("embedding only"))
        .await
        .context("startup failed")?;
    let outcomes = app.ingestor.ingest_batch(documents, collection).await;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => println!(
                "  {} → {} ({} chunks)",
                outcome.document,
                outcome.collection,
                outcome.chunk_ids.len()
            ),
            Some(e) => {
                failed += 1;
                println!("  {} failed: {}", outcome.document, e);
            }
        }
    }
    println!(
        "Embedded {} of {} documents",
        outcomes.len() - failed,
        outcomes.len()
    );
    if failed > 0 || !read_errors.is_empty() {
        bail!("{} documents could not be ingested", failed + read_errors.len());
    }
    Ok(())
}

async fn ask(cfg: Config, query: &str, collection: &str, k: Option<usize>) -> anyhow::Result<()> {
    let generator = load_generator(&cfg, true)
        .await
        .context("model provisioning failed")?;
    let app = App::open(cfg, generator)
        .await
        .context("startup failed")?;

    let cancel = CancellationToken::new();
    let (sink, mut tokens) = TokenSink::channel(64, cancel.clone());
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(token) = tokens.recv().await {
            let _ = write!(stdout, "{}", token);
            let _ = stdout.flush();
        }
    });
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = app.query.answer_streaming(query, collection, k, &sink).await;
    drop(sink);
    interrupt.abort();
    let _ = printer.await;
    println!();

    let answer = result?;
    println!("\nSources:");
    for chunk in &answer.sources {
        println!(
            "  {} @ {}  {}",
            chunk.metadata.source,
            chunk.metadata.offset,
            preview(&chunk.text, 80)
        );
    }
    Ok(())
}

async fn list_collections(cfg: &Config) -> anyhow::Result<()> {
    let store = VectorStore::open(&cfg.store.persist_directory).await?;
    let names = store.list_collections().await;
    if names.is_empty() {
        println!("No collections in {}", store.root().display());
        return Ok(());
    }
    println!("{:<32} {:>6} {:>8}  MODEL", "NAME", "DIM", "CHUNKS");
    for name in names {
        match store.collection_info(&name).await {
            Ok(info) => println!(
                "{:<32} {:>6} {:>8}  {}",
                info.name, info.dimension, info.chunk_count, info.embedding_model
            ),
            Err(e) => println!("{:<32} unavailable: {}", name, e),
        }
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
