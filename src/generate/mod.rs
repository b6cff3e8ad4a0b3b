//! Answer generation over a pluggable backend.
//!
//! A [`Generator`] owns at most one [`GenerationBackend`]. Calls against the
//! same backend are serialised by a per-backend `tokio::sync::Mutex`; waiting
//! for it, and the generation itself, stop as soon as the request's
//! [`TokenSink`] is cancelled. Without a backend every call fails with
//! [`Error::UnsupportedModel`] before any work is done.
//!
//! Tokens are pushed through the sink as they are produced. The returned
//! [`Answer`] carries the full text plus the chunks that made it into the
//! prompt after context-window truncation.

#[cfg(feature = "llama")]
mod llama;
mod prompt;

#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use prompt::{build_prompt, estimate_tokens, BuiltPrompt, PromptTemplate};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::models::{Answer, Chunk};
use crate::provision::ModelHandle;

/// A text-generation runtime with a fixed context window.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum tokens of prompt plus output.
    fn context_window(&self) -> usize;

    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn template(&self) -> PromptTemplate;

    /// Generate a completion for `prompt`, emitting each token to `sink`.
    /// Must stop and return [`Error::Cancelled`] once the sink is cancelled.
    async fn generate(&self, prompt: &str, sink: &TokenSink) -> Result<String>;
}

/// Where generated tokens go: a bounded channel plus a cancellation token.
#[derive(Clone)]
pub struct TokenSink {
    tx: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
}

impl TokenSink {
    /// A sink and its receiving end.
    pub fn channel(capacity: usize, cancel: CancellationToken) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                cancel,
            },
            rx,
        )
    }

    /// A sink that drops tokens; only the final answer is wanted.
    pub fn discard() -> Self {
        Self::detached(CancellationToken::new())
    }

    /// A token-dropping sink tied to a caller-owned cancellation token.
    pub fn detached(cancel: CancellationToken) -> Self {
        Self { tx: None, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the sink is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn emit(&self, token: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            sent = tx.send(token.to_string()) => sent.map_err(|_| Error::Cancelled),
        }
    }

    /// [`emit`](Self::emit) for backends running on a blocking thread.
    pub fn blocking_emit(&self, token: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match &self.tx {
            Some(tx) => tx
                .blocking_send(token.to_string())
                .map_err(|_| Error::Cancelled),
            None => Ok(()),
        }
    }
}

struct Slot {
    backend: Arc<dyn GenerationBackend>,
    lock: Mutex<()>,
}

pub struct Generator {
    slot: Option<Slot>,
    unsupported_reason: String,
    max_tokens: usize,
    timeout: Option<Duration>,
}

impl Generator {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: &ModelConfig) -> Self {
        Self {
            slot: Some(Slot {
                backend,
                lock: Mutex::new(()),
            }),
            unsupported_reason: String::new(),
            max_tokens: config.max_tokens,
            timeout: config.generation_timeout(),
        }
    }

    /// A generator with no backend; every call fails with `reason`.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self {
            slot: None,
            unsupported_reason: reason.into(),
            max_tokens: 0,
            timeout: None,
        }
    }

    /// Load the runtime for a provisioned model.
    pub fn from_handle(handle: Option<&ModelHandle>, config: &ModelConfig) -> Result<Self> {
        let Some(handle) = handle else {
            return Ok(Self::unsupported("no model type configured"));
        };

        #[cfg(feature = "llama")]
        let generator = {
            let backend = LlamaCppBackend::load(handle, config)?;
            Self::new(Arc::new(backend), config)
        };

        #[cfg(not(feature = "llama"))]
        let generator = {
            tracing::warn!(
                model = %handle.model_type,
                "built without the `llama` feature; generation is unavailable"
            );
            let _ = config;
            Self::unsupported(format!(
                "{} requires building with --features llama",
                handle.model_type
            ))
        };

        Ok(generator)
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_some()
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.slot.as_ref().map(|s| s.backend.name())
    }

    /// Answer `query` from `chunks` (in rank order).
    ///
    /// Dropping the returned future cancels `sink`, so a backend still running
    /// on another thread stops at its next token.
    pub async fn generate(&self, query: &str, chunks: &[Chunk], sink: &TokenSink) -> Result<Answer> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| Error::UnsupportedModel(self.unsupported_reason.clone()))?;

        let cancel_on_drop = sink.cancel.clone().drop_guard();
        let result = self.run(slot, query, chunks, sink).await;
        cancel_on_drop.disarm();
        result
    }

    async fn run(
        &self,
        slot: &Slot,
        query: &str,
        chunks: &[Chunk],
        sink: &TokenSink,
    ) -> Result<Answer> {
        let backend = slot.backend.as_ref();

        let _guard = tokio::select! {
            biased;
            _ = sink.cancelled() => return Err(Error::Cancelled),
            guard = slot.lock.lock() => guard,
        };

        let budget = backend.context_window().saturating_sub(self.max_tokens);
        let prompt = build_prompt(backend.template(), query, chunks, budget, |t| {
            backend.count_tokens(t)
        })?;
        tracing::debug!(
            backend = backend.name(),
            prompt_tokens = prompt.tokens,
            budget,
            context_chunks = prompt.included.len(),
            "generating"
        );

        let run = backend.generate(&prompt.text, sink);
        let text = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    sink.cancel();
                    tracing::warn!(backend = backend.name(), secs = limit.as_secs(), "generation timed out");
                    return Err(Error::GenerationTimeout(limit.as_secs()));
                }
            },
            None => run.await?,
        };

        Ok(Answer {
            text,
            sources: prompt.included,
        })
    }
}
