//! # ragloom
//!
//! A local-first retrieval-augmented generation service. Documents are
//! extracted, chunked, embedded and stored in named collections on disk;
//! questions are answered by a local model from the most similar chunks,
//! with tokens streamed as they are produced.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │  embed   │──▶│   Ingestor   │──▶│ VectorStore  │
//! │ (files)  │   │ extract+chunk│   │ per-collection│
//! └──────────┘   │ +embed       │   └──────┬───────┘
//!                └──────────────┘          │
//! ┌──────────┐   ┌──────────────┐   ┌──────▼───────┐
//! │ retrieve │──▶│ QueryService │──▶│  Retriever   │
//! │ (query)  │   │              │   └──────────────┘
//! └──────────┘   │              │──▶ Generator ──▶ backend (llama.cpp)
//!                └──────────────┘
//! ```
//!
//! The model artifact is provisioned once at startup ([`provision`]) and
//! handed to the generator as a [`provision::ModelHandle`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`provision`] | Model download and cache |
//! | [`extract`] | Text extraction from uploads |
//! | [`chunk`] | Paragraph-aware chunking |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Persistent per-collection vector store |
//! | [`ingest`] | Document ingestion |
//! | [`retrieve`] | Similarity search |
//! | [`generate`] | Prompt building and generation backends |
//! | [`query`] | Retrieve-then-generate orchestration |
//! | [`server`] | HTTP API |

pub mod app;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod provision;
pub mod query;
pub mod retrieve;
pub mod server;
pub mod store;

pub use error::{Error, Result};
