//! Overlapping text chunker.
//!
//! Splits extracted document text into contiguous spans of at most
//! `chunk_size` bytes, cut on UTF-8 character boundaries. Within each
//! window the cut prefers a paragraph break (`\n\n`), then a line break,
//! then any whitespace, and only falls back to a hard cut when the window
//! holds a single unbroken run. Consecutive chunks share up to `overlap`
//! bytes so that context survives the boundary.
//!
//! Each chunk id is a SHA-256 of its source and whitespace-normalised text,
//! so re-chunking unchanged content reproduces the same ids.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::models::{ChunkMetadata, TextChunk};

#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 50,
        }
    }
}

/// Split `text` into chunks attributed to `source`.
///
/// Whitespace-only input yields no chunks. Spans with identical normalised
/// content collapse to their first occurrence.
pub fn chunk_text(source: &str, text: &str, policy: &ChunkPolicy) -> Vec<TextChunk> {
    let size = policy.chunk_size.max(1);
    let overlap = policy.overlap.min(size - 1);

    let mut chunks = Vec::new();
    let mut seen = HashSet::new();
    let mut start = skip_whitespace(text, 0);

    while start < text.len() {
        let window_end = floor_boundary(text, (start + size).min(text.len()));
        let mut end = if window_end >= text.len() {
            text.len()
        } else {
            find_break(text, start, window_end)
        };
        if end <= start {
            // A single character wider than the window.
            end = ceil_boundary(text, start + 1);
        }

        let span = &text[start..end];
        let body = span.trim();
        if !body.is_empty() {
            let lead = span.len() - span.trim_start().len();
            let id = chunk_id(source, body);
            if seen.insert(id.clone()) {
                chunks.push(TextChunk {
                    id,
                    text: body.to_string(),
                    metadata: ChunkMetadata {
                        source: source.to_string(),
                        offset: start + lead,
                    },
                });
            }
        }

        if end >= text.len() {
            break;
        }

        let back = ceil_boundary(text, end.saturating_sub(overlap).max(start + 1));
        let mut next = skip_whitespace(text, snap_to_word_start(text, back, end));
        if next <= start {
            next = end;
        }
        start = next;
    }

    chunks
}

/// Deterministic chunk identifier: hex SHA-256 of `source`, a NUL separator,
/// and the text with whitespace runs collapsed to single spaces.
pub fn chunk_id(source: &str, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pick the cut position inside `text[start..window_end]`.
fn find_break(text: &str, start: usize, window_end: usize) -> usize {
    let window = &text[start..window_end];
    // Breaks in the first quarter would leave a sliver of a chunk.
    let min = window.len() / 4;

    let candidates = [
        window.rfind("\n\n"),
        window.rfind('\n'),
        window.rfind(char::is_whitespace),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|&pos| pos > min)
        .map(|pos| start + pos)
        .unwrap_or(window_end)
}

fn snap_to_word_start(text: &str, pos: usize, limit: usize) -> usize {
    let at_word_start = text[..pos]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace);
    if at_word_start {
        return pos;
    }
    text[pos..limit]
        .find(char::is_whitespace)
        .map(|i| pos + i)
        .unwrap_or(pos)
}

fn skip_whitespace(text: &str, pos: usize) -> usize {
    let rest = &text[pos..];
    pos + (rest.len() - rest.trim_start().len())
}

fn floor_boundary(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}
