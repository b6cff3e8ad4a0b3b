//! Prompt templates and context-window budgeting.
//!
//! Retrieved chunks are stuffed into the prompt in rank order. Chunks are
//! admitted while the rendered prompt still fits the token budget; the first
//! chunk that would overflow is dropped together with everything ranked
//! below it, so truncation always removes the lowest-ranked context first.

use crate::error::{Error, Result};
use crate::models::Chunk;

const INSTRUCTIONS: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

/// Invocation convention of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// Plain instructions, context, then `Question:` / `Helpful Answer:`.
    Plain,
    /// Llama-2 chat style `[INST] <<SYS>> ... [/INST]`.
    LlamaInstruct,
    /// GPT4All `### Prompt:` / `### Response:`.
    PromptResponse,
}

impl PromptTemplate {
    pub fn render(&self, query: &str, context: &[&str]) -> String {
        let context = context.join("\n\n");
        match self {
            PromptTemplate::Plain => format!(
                "{}\n\n{}\n\nQuestion: {}\nHelpful Answer:",
                INSTRUCTIONS, context, query
            ),
            PromptTemplate::LlamaInstruct => format!(
                "[INST] <<SYS>>\n{}\n<</SYS>>\n\n{}\n\nQuestion: {} [/INST]",
                INSTRUCTIONS, context, query
            ),
            PromptTemplate::PromptResponse => format!(
                "### Prompt:\n{}\n\n{}\n\nQuestion: {}\n### Response:\n",
                INSTRUCTIONS, context, query
            ),
        }
    }
}

/// A prompt that fits its budget, and the chunks it includes.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub text: String,
    pub tokens: usize,
    pub included: Vec<Chunk>,
}

/// Rough token count for backends without a tokenizer: ⌈chars / 4⌉.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Render `query` with as many leading `chunks` as fit in `budget` tokens.
///
/// Fails with [`Error::Generation`] if the query alone does not fit.
pub fn build_prompt(
    template: PromptTemplate,
    query: &str,
    chunks: &[Chunk],
    budget: usize,
    count_tokens: impl Fn(&str) -> usize,
) -> Result<BuiltPrompt> {
    let bare = template.render(query, &[]);
    let bare_tokens = count_tokens(&bare);
    if bare_tokens > budget {
        return Err(Error::Generation(format!(
            "prompt needs {} tokens without any context, budget is {}",
            bare_tokens, budget
        )));
    }

    let mut best = BuiltPrompt {
        text: bare,
        tokens: bare_tokens,
        included: Vec::new(),
    };
    let mut texts: Vec<&str> = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        texts.push(&chunk.text);
        let candidate = template.render(query, &texts);
        let tokens = count_tokens(&candidate);
        if tokens > budget {
            tracing::debug!(
                kept = i,
                dropped = chunks.len() - i,
                budget,
                "context truncated to fit window"
            );
            break;
        }
        best = BuiltPrompt {
            text: candidate,
            tokens,
            included: chunks[..=i].to_vec(),
        };
    }
    Ok(best)
}
