//! HTTP front end.
//!
//! A thin axum layer over [`App`]: every handler validates its parameters,
//! calls one component operation and maps the result to JSON.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Readiness message |
//! | `GET`  | `/collections` | Collections with dimension, model and chunk count |
//! | `POST` | `/embed?collection_name=` | Ingest multipart `files` |
//! | `POST` | `/retrieve?query=&collection_name=` | Answer a question |
//! | `POST` | `/retrieve/stream?query=&collection_name=` | Same, as Server-Sent Events |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "unknown collection: docs" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `ingestion_failed` (422), `unsupported_model` (501), `timeout` (504),
//! `generation_failed` (500), `internal` (500).
//!
//! `/embed` answers 200 even when some files fail; the `outcomes` list carries
//! the per-file status.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;
use crate::error::Error;
use crate::generate::TokenSink;
use crate::ingest::IngestOutcome;
use crate::models::{Answer, Chunk, Document};
use crate::store::CollectionInfo;

const READY_MESSAGE: &str = "Hello, the APIs are now ready for your embeds and queries!";
const STREAM_BUFFER: usize = 64;

/// Build the router. Exposed separately from [`run_server`] so callers can
/// bind their own listener.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let upload_limit = app.config.server.max_upload_bytes;

    Router::new()
        .route("/", get(handle_root))
        .route("/collections", get(handle_collections))
        .route("/embed", post(handle_embed))
        .route("/retrieve", post(handle_retrieve))
        .route("/retrieve/stream", post(handle_retrieve_stream))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(cors)
        .with_state(app)
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    println!("ragloom listening on http://{}", bind_addr);

    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code.clone(),
                message: self.message.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = self.body();
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = classify(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, code, "request failed");
        } else {
            tracing::debug!(error = %err, code, "request rejected");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::InvalidRequest(_) | Error::InvalidCollectionName { .. } => {
            (StatusCode::BAD_REQUEST, "bad_request")
        }
        Error::UnknownCollection(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::DimensionMismatch { .. } | Error::EmbeddingModelMismatch { .. } => {
            (StatusCode::CONFLICT, "conflict")
        }
        Error::Ingestion { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "ingestion_failed"),
        Error::UnsupportedModel(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported_model"),
        Error::GenerationTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        Error::Generation(_) | Error::Cancelled => {
            (StatusCode::INTERNAL_SERVER_ERROR, "generation_failed")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

/// Blank query parameters count as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ============ GET / ============

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn handle_root() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: READY_MESSAGE.to_string(),
    })
}

// ============ GET /collections ============

#[derive(Serialize)]
struct CollectionsResponse {
    collections: Vec<CollectionEntry>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum CollectionEntry {
    Ready(CollectionInfo),
    Unavailable { name: String, error: ErrorDetail },
}

async fn handle_collections(State(app): State<Arc<App>>) -> Json<CollectionsResponse> {
    let mut collections = Vec::new();
    for name in app.store.list_collections().await {
        let entry = match app.store.collection_info(&name).await {
            Ok(info) => CollectionEntry::Ready(info),
            Err(e) => {
                let (_, code) = classify(&e);
                CollectionEntry::Unavailable {
                    name,
                    error: ErrorDetail {
                        code: code.to_string(),
                        message: e.to_string(),
                    },
                }
            }
        };
        collections.push(entry);
    }
    Json(CollectionsResponse { collections })
}

// ============ POST /embed ============

#[derive(Deserialize)]
struct EmbedParams {
    collection_name: Option<String>,
}

#[derive(Serialize)]
struct EmbedResponse {
    message: String,
    saved_files: Vec<String>,
    outcomes: Vec<IngestOutcome>,
}

async fn handle_embed(
    State(app): State<Arc<App>>,
    Query(params): Query<EmbedParams>,
    mut multipart: Multipart,
) -> Result<Json<EmbedResponse>, AppError> {
    let mut documents = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("every file part needs a filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read {}: {}", name, e)))?;
        documents.push(Document::new(name, bytes.to_vec()));
    }
    if documents.is_empty() {
        return Err(Error::InvalidRequest("no files uploaded".into()).into());
    }

    let collection = non_empty(params.collection_name);
    let outcomes = app
        .ingestor
        .ingest_batch(documents, collection.as_deref())
        .await;

    let saved_files: Vec<String> = outcomes
        .iter()
        .filter(|o| o.is_ok())
        .map(|o| o.document.clone())
        .collect();
    let message = if saved_files.len() == outcomes.len() {
        "Files embedded successfully".to_string()
    } else {
        format!(
            "{} of {} files embedded",
            saved_files.len(),
            outcomes.len()
        )
    };

    Ok(Json(EmbedResponse {
        message,
        saved_files,
        outcomes,
    }))
}

// ============ POST /retrieve ============

#[derive(Deserialize)]
struct RetrieveParams {
    query: Option<String>,
    collection_name: Option<String>,
    k: Option<usize>,
}

impl RetrieveParams {
    fn into_parts(self) -> Result<(String, String, Option<usize>), AppError> {
        let query = non_empty(self.query).ok_or_else(|| bad_request("query must not be empty"))?;
        let collection = non_empty(self.collection_name)
            .ok_or_else(|| bad_request("collection_name is required"))?;
        if self.k == Some(0) {
            return Err(bad_request("k must be at least 1"));
        }
        Ok((query, collection, self.k))
    }
}

#[derive(Serialize)]
struct RetrieveResponse {
    results: String,
    docs: Vec<Chunk>,
}

impl From<Answer> for RetrieveResponse {
    fn from(answer: Answer) -> Self {
        RetrieveResponse {
            results: answer.text,
            docs: answer.sources,
        }
    }
}

async fn handle_retrieve(
    State(app): State<Arc<App>>,
    Query(params): Query<RetrieveParams>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let (query, collection, k) = params.into_parts()?;
    // Cancelled when axum drops this future because the client went away.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let answer = app
        .query
        .answer_streaming(&query, &collection, k, &TokenSink::detached(cancel))
        .await?;
    Ok(Json(answer.into()))
}

// ============ POST /retrieve/stream ============

/// Streams `token` events while generating, then one `done` event carrying
/// the answer, or one `error` event. Dropping the response (client gone)
/// cancels generation and releases the backend.
async fn handle_retrieve_stream(
    State(app): State<Arc<App>>,
    Query(params): Query<RetrieveParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (query, collection, k) = params.into_parts()?;

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let (event_tx, event_rx) = mpsc::channel::<Event>(STREAM_BUFFER);

    tokio::spawn(async move {
        let (sink, mut tokens) = TokenSink::channel(STREAM_BUFFER, cancel.clone());
        let producer = app.query.answer_streaming(&query, &collection, k, &sink);
        tokio::pin!(producer);

        let result = loop {
            tokio::select! {
                result = &mut producer => break result,
                Some(token) = tokens.recv() => {
                    if event_tx.send(Event::default().event("token").data(token)).await.is_err() {
                        cancel.cancel();
                    }
                }
            }
        };
        while let Ok(token) = tokens.try_recv() {
            if event_tx
                .send(Event::default().event("token").data(token))
                .await
                .is_err()
            {
                return;
            }
        }

        let last = match result {
            Ok(answer) => Event::default()
                .event("done")
                .json_data(RetrieveResponse::from(answer)),
            Err(err) => Event::default()
                .event("error")
                .json_data(AppError::from(err).body()),
        }
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        let _ = event_tx.send(last).await;
    });

    let stream = ReceiverStream::new(event_rx).map(move |event| {
        let _ = &guard;
        Ok::<_, Infallible>(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
