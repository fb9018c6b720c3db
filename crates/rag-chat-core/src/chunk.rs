//! Boundary-aware text chunker.
//!
//! Splits normalized page text into passages that respect a token budget
//! measured by a pluggable [`Tokenizer`].
//!
//! # Algorithm
//!
//! 1. Split text into paragraphs on blank lines.
//! 2. A paragraph that fits within `max_tokens` is one unit. A larger
//!    paragraph is split into sentences (`.`, `!`, `?` followed by
//!    whitespace, or the full-width `。！？`).
//! 3. A sentence that alone exceeds `max_tokens` is hard-split at the
//!    longest prefix that fits, backed off to the last whitespace.
//! 4. Units are packed greedily: a chunk is flushed when adding the next
//!    unit would exceed `max_tokens`.
//! 5. With `overlap_tokens > 0`, the next chunk is seeded with whole
//!    trailing units of the previous chunk that fit in the overlap budget.
//!
//! The output depends only on the input text, the config and the
//! tokenizer, so re-ingesting a page reproduces the same chunk sequence.
//!
//! # Example
//!
//! ```rust
//! use rag_chat_core::chunk::{chunk_text, ChunkConfig, WhitespaceTokenizer};
//!
//! let config = ChunkConfig { max_tokens: 600, overlap_tokens: 0 };
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", &config, &WhitespaceTokenizer);
//! assert_eq!(chunks, vec!["Hello world.\n\nSecond paragraph.".to_string()]);
//! ```

/// Counts tokens in a piece of text.
///
/// Implementations must be deterministic and monotonic: a prefix never
/// counts more than the whole string.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Approximates tokens as `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenizer {
    pub chars_per_token: usize,
}

impl Default for CharRatioTokenizer {
    fn default() -> Self {
        // Rough heuristic: 4 chars ≈ 1 token.
        Self { chars_per_token: 4 }
    }
}

impl Tokenizer for CharRatioTokenizer {
    fn count(&self, text: &str) -> usize {
        let ratio = self.chars_per_token.max(1);
        text.chars().count().div_ceil(ratio)
    }
}

/// One token per whitespace-separated word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 600,
            overlap_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Unit<'a> {
    text: &'a str,
    paragraph: usize,
}

/// Split `text` into chunks of at most `config.max_tokens` tokens.
///
/// Returns an empty vector for empty or whitespace-only text.
pub fn chunk_text(text: &str, config: &ChunkConfig, tokenizer: &dyn Tokenizer) -> Vec<String> {
    let max_tokens = config.max_tokens.max(1);

    let mut units = Vec::new();
    for (paragraph, para) in split_paragraphs(text).into_iter().enumerate() {
        if tokenizer.count(para) <= max_tokens {
            units.push(Unit {
                text: para,
                paragraph,
            });
            continue;
        }
        for sentence in split_sentences(para) {
            if tokenizer.count(sentence) <= max_tokens {
                units.push(Unit {
                    text: sentence,
                    paragraph,
                });
            } else {
                units.extend(
                    hard_split(sentence, max_tokens, tokenizer)
                        .into_iter()
                        .map(|piece| Unit {
                            text: piece,
                            paragraph,
                        }),
                );
            }
        }
    }

    let mut chunks = Vec::new();
    let mut current: Vec<Unit> = Vec::new();

    for unit in units {
        if current.is_empty() || tokenizer.count(&render(&current, Some(unit))) <= max_tokens {
            current.push(unit);
            continue;
        }

        chunks.push(render(&current, None));
        current = overlap_tail(&current, config.overlap_tokens, tokenizer);
        if !current.is_empty() && tokenizer.count(&render(&current, Some(unit))) > max_tokens {
            current.clear();
        }
        current.push(unit);
    }

    if !current.is_empty() {
        chunks.push(render(&current, None));
    }

    chunks
}

/// Join units: sentences of one paragraph with a space, paragraphs with a
/// blank line.
fn render(units: &[Unit], extra: Option<Unit>) -> String {
    let mut out = String::new();
    let mut prev: Option<usize> = None;
    for unit in units.iter().copied().chain(extra) {
        match prev {
            Some(p) if p == unit.paragraph => out.push(' '),
            Some(_) => out.push_str("\n\n"),
            None => {}
        }
        out.push_str(unit.text);
        prev = Some(unit.paragraph);
    }
    out
}

/// Trailing units of `units` (never all of them) whose rendering fits in
/// `overlap_tokens`.
fn overlap_tail<'a>(
    units: &[Unit<'a>],
    overlap_tokens: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<Unit<'a>> {
    if overlap_tokens == 0 || units.len() < 2 {
        return Vec::new();
    }
    let mut take = 0;
    for n in 1..units.len() {
        let tail = &units[units.len() - n..];
        if tokenizer.count(&render(tail, None)) > overlap_tokens {
            break;
        }
        take = n;
    }
    units[units.len() - take..].to_vec()
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            let para = text[start..offset].trim();
            if !para.is_empty() {
                out.push(para);
            }
            start = offset + line.len();
        }
        offset += line.len();
    }
    let para = text[start..].trim();
    if !para.is_empty() {
        out.push(para);
    }
    out
}

fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '。' | '！' | '？' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = paragraph[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let rest = paragraph[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Cut an oversized sentence into pieces that each fit `max_tokens`.
fn hard_split<'a>(
    sentence: &'a str,
    max_tokens: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut remaining = sentence.trim();

    while !remaining.is_empty() {
        if tokenizer.count(remaining) <= max_tokens {
            pieces.push(remaining);
            break;
        }

        let ends: Vec<usize> = remaining
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .collect();
        let fit = ends.partition_point(|&end| tokenizer.count(&remaining[..end]) <= max_tokens);
        // Always make progress, even if a single char is over budget.
        let mut cut = if fit == 0 { ends[0] } else { ends[fit - 1] };

        if cut < remaining.len() {
            if let Some(ws) = remaining[..cut].rfind(char::is_whitespace) {
                if ws > 0 {
                    cut = ws;
                }
            }
        }

        let piece = remaining[..cut].trim_end();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = remaining[cut..].trim_start();
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(max_tokens: usize) -> ChunkConfig {
        ChunkConfig {
            max_tokens,
            overlap_tokens: 0,
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", &words(600), &WhitespaceTokenizer);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", &words(10), &WhitespaceTokenizer).is_empty());
        assert!(chunk_text("  \n\n \n", &words(10), &WhitespaceTokenizer).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_until_limit() {
        let text = "one two three.\n\nfour five six.\n\nseven eight nine.";
        let chunks = chunk_text(text, &words(6), &WhitespaceTokenizer);
        assert_eq!(
            chunks,
            vec![
                "one two three.\n\nfour five six.".to_string(),
                "seven eight nine.".to_string(),
            ]
        );
    }

    #[test]
    fn test_large_paragraph_splits_on_sentences() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota.";
        let chunks = chunk_text(text, &words(6), &WhitespaceTokenizer);
        assert_eq!(
            chunks,
            vec![
                "Alpha beta gamma. Delta epsilon zeta.".to_string(),
                "Eta theta iota.".to_string(),
            ]
        );
    }

    #[test]
    fn test_oversized_sentence_hard_split_on_whitespace() {
        let text = "a b c d e f g h i j";
        let chunks = chunk_text(text, &words(4), &WhitespaceTokenizer);
        assert_eq!(chunks, vec!["a b c d", "e f g h", "i j"]);
    }

    #[test]
    fn test_every_chunk_within_budget() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ");
        let tokenizer = CharRatioTokenizer::default();
        let config = words(20);
        let chunks = chunk_text(&text, &config, &tokenizer);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(tokenizer.count(c) <= config.max_tokens, "over budget: {:?}", c);
        }
    }

    #[test]
    fn test_unbroken_text_hard_split() {
        let text = "x".repeat(100);
        let tokenizer = CharRatioTokenizer::default();
        let chunks = chunk_text(&text, &words(5), &tokenizer);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() == 20));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_multibyte_sentences() {
        let text = "これはテストです。二つ目の文です。三つ目の文です。";
        let tokenizer = CharRatioTokenizer { chars_per_token: 1 };
        let chunks = chunk_text(text, &words(10), &tokenizer);
        assert_eq!(
            chunks,
            vec!["これはテストです。", "二つ目の文です。", "三つ目の文です。"]
        );
    }

    #[test]
    fn test_overlap_carries_trailing_sentence() {
        let text = "One two. Three four. Five six. Seven eight.";
        let config = ChunkConfig {
            max_tokens: 4,
            overlap_tokens: 2,
        };
        let chunks = chunk_text(text, &config, &WhitespaceTokenizer);
        assert_eq!(
            chunks,
            vec![
                "One two. Three four.",
                "Three four. Five six.",
                "Five six. Seven eight.",
            ]
        );
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha one.\n\nBeta two. Gamma three.\n\nDelta four five six seven eight nine ten.";
        let config = ChunkConfig {
            max_tokens: 5,
            overlap_tokens: 2,
        };
        let a = chunk_text(text, &config, &WhitespaceTokenizer);
        let b = chunk_text(text, &config, &WhitespaceTokenizer);
        assert_eq!(a, b);
    }

    #[test]
    fn test_abbreviation_dot_without_space_is_not_boundary() {
        let sentences = split_sentences("Version 1.5 is out. Upgrade now.");
        assert_eq!(sentences, vec!["Version 1.5 is out.", "Upgrade now."]);
    }
}
