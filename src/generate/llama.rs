//! In-process llama.cpp backend (GGUF weights).
//!
//! Serves both `LlamaCpp` and `GPT4All` model types; they differ only in
//! prompt template. Decoding runs on a blocking thread and checks the sink
//! for cancellation before every token.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
};
use tokio::sync::Mutex;

use super::{estimate_tokens, GenerationBackend, PromptTemplate, TokenSink};
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::provision::{ModelHandle, ModelType};

struct Loaded {
    backend: LlamaBackend,
    model: LlamaModel,
}

pub struct LlamaCppBackend {
    name: String,
    template: PromptTemplate,
    n_ctx: usize,
    max_tokens: usize,
    temperature: f32,
    threads: Option<usize>,
    loaded: Arc<Mutex<Loaded>>,
}

impl LlamaCppBackend {
    /// Load the weights referenced by `handle`. Blocking.
    pub fn load(handle: &ModelHandle, config: &ModelConfig) -> Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| Error::Configuration(format!("llama.cpp backend init: {:?}", e)))?;
        let params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(&backend, &handle.path, &params).map_err(|e| {
            Error::Configuration(format!(
                "failed to load model {}: {:?}",
                handle.path.display(),
                e
            ))
        })?;
        tracing::info!(model = %handle.model_type, path = %handle.path.display(), n_ctx = config.n_ctx, "model loaded");

        let template = match handle.model_type {
            ModelType::LlamaCpp => PromptTemplate::LlamaInstruct,
            ModelType::Gpt4All => PromptTemplate::PromptResponse,
        };
        Ok(Self {
            name: handle.model_type.to_string(),
            template,
            n_ctx: config.n_ctx,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            threads: config.threads,
            loaded: Arc::new(Mutex::new(Loaded { backend, model })),
        })
    }
}

#[async_trait]
impl GenerationBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_window(&self) -> usize {
        self.n_ctx
    }

    fn count_tokens(&self, text: &str) -> usize {
        // A cancelled decode may still hold the model for one more step.
        let Ok(loaded) = self.loaded.try_lock() else {
            tracing::debug!("model busy, estimating token count");
            return estimate_tokens(text);
        };
        loaded
            .model
            .str_to_token(text, AddBos::Always)
            .map(|tokens| tokens.len())
            .unwrap_or_else(|_| estimate_tokens(text))
    }

    fn template(&self) -> PromptTemplate {
        self.template
    }

    async fn generate(&self, prompt: &str, sink: &TokenSink) -> Result<String> {
        let loaded = Arc::clone(&self.loaded);
        let prompt = prompt.replace('\0', "");
        let sink = sink.clone();
        let params = DecodeParams {
            n_ctx: self.n_ctx,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            threads: self.threads,
        };

        let loaded = loaded.lock_owned().await;
        tokio::task::spawn_blocking(move || decode(&loaded, &prompt, &params, &sink))
        .await
        .map_err(|e| Error::Generation(format!("generation task failed: {}", e)))?
    }
}

struct DecodeParams {
    n_ctx: usize,
    max_tokens: usize,
    temperature: f32,
    threads: Option<usize>,
}

fn decode(loaded: &Loaded, prompt: &str, params: &DecodeParams, sink: &TokenSink) -> Result<String> {
    let model = &loaded.model;
    let prompt_tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| Error::Generation(format!("tokenize: {:?}", e)))?;
    if prompt_tokens.is_empty() || prompt_tokens.len() >= params.n_ctx {
        return Err(Error::Generation(format!(
            "prompt is {} tokens, context window is {}",
            prompt_tokens.len(),
            params.n_ctx
        )));
    }

    let mut ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(params.n_ctx as u32))
        .with_n_batch(params.n_ctx as u32);
    if let Some(threads) = params.threads {
        ctx_params = ctx_params
            .with_n_threads(threads as i32)
            .with_n_threads_batch(threads as i32);
    }
    let mut context = model
        .new_context(&loaded.backend, ctx_params)
        .map_err(|e| Error::Generation(format!("create context: {:?}", e)))?;

    let mut batch = LlamaBatch::new(params.n_ctx, 1);
    let last = prompt_tokens.len() - 1;
    for (i, &token) in prompt_tokens.iter().enumerate() {
        batch
            .add(token, i as i32, &[0], i == last)
            .map_err(|e| Error::Generation(format!("batch: {:?}", e)))?;
    }
    context
        .decode(&mut batch)
        .map_err(|e| Error::Generation(format!("decode: {:?}", e)))?;

    let mut sampler = LlamaSampler::chain_simple([
        LlamaSampler::temp(params.temperature),
        LlamaSampler::greedy(),
    ]);
    let eos = model.token_eos();
    let limit = (prompt_tokens.len() + params.max_tokens).min(params.n_ctx);
    let mut n_cur = prompt_tokens.len();
    let mut output = String::new();

    while n_cur < limit {
        if sink.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let token = sampler.sample(&context, -1);
        if token == eos {
            break;
        }
        // Tokens that are not valid UTF-8 on their own still advance the model.
        if let Ok(piece) = model.token_to_str(token, Special::Plaintext) {
            sink.blocking_emit(&piece)?;
            output.push_str(&piece);
        }

        batch.clear();
        batch
            .add(token, n_cur as i32, &[0], true)
            .map_err(|e| Error::Generation(format!("batch: {:?}", e)))?;
        context
            .decode(&mut batch)
            .map_err(|e| Error::Generation(format!("decode: {:?}", e)))?;
        n_cur += 1;
    }

    tracing::debug!(
        prompt_tokens = prompt_tokens.len(),
        generated = n_cur - prompt_tokens.len(),
        "decode finished"
    );
    Ok(output)
}
