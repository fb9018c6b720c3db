//! Merge, threshold, rank and cap retrieval results.
//!
//! Scores from different namespaces are compared directly. That is only
//! meaningful because every namespace is embedded with the same model and
//! searched with the same metric.

use std::cmp::Ordering;

use crate::models::ScoredChunk;

pub const DEFAULT_TOP_K: usize = 8;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.35;
pub const DEFAULT_MAX_CONTEXT_CHUNKS: usize = 5;
pub const DEFAULT_MAX_CITED_URLS: usize = 3;

/// Retrieval knobs for one chat turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    /// Nearest neighbours requested per namespace.
    pub top_k: usize,
    /// Hits scoring below this are discarded.
    pub similarity_threshold: f32,
    pub max_context_chunks: usize,
    pub max_cited_urls: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_context_chunks: DEFAULT_MAX_CONTEXT_CHUNKS,
            max_cited_urls: DEFAULT_MAX_CITED_URLS,
        }
    }
}

/// Build the context set from merged hits.
///
/// Keeps hits with `score >= similarity_threshold`, sorts them by score
/// descending (stable, so equal scores keep their input order) and keeps at
/// most `max_context_chunks`.
pub fn select_context(candidates: Vec<ScoredChunk>, params: &RetrievalParams) -> Vec<ScoredChunk> {
    let mut kept: Vec<ScoredChunk> = candidates
        .into_iter()
        .filter(|c| c.score >= params.similarity_threshold)
        .collect();
    kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    kept.truncate(params.max_context_chunks);
    kept
}

/// Distinct URLs across the context set in context order, capped.
pub fn cited_urls(context: &[ScoredChunk], max_cited_urls: usize) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for c in context {
        if urls.len() >= max_cited_urls {
            break;
        }
        if !urls.iter().any(|u| u == &c.chunk.url) {
            urls.push(c.chunk.url.clone());
        }
    }
    urls
}
