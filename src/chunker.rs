//! Sentence-aware text chunker.
//!
//! Splits plaintext into [`Chunk`]s that respect a target size in tokens
//! (4-chars-per-token approximation) with a configurable overlap carried as
//! whole trailing sentences. Byte offset ranges into the original text are
//! preserved on every chunk.
//!
//! Each chunk receives a stable id derived from `(doc_id, start_offset,
//! end_offset, text hash)`, so re-ingesting unchanged content produces the
//! same ids and idempotent upserts become no-ops.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A sentence span within the source text (byte offsets).
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Split text into sentence-aligned chunks of at most `chunk_size` tokens,
/// overlapping consecutive chunks by up to `chunk_overlap` tokens.
///
/// A document with no non-whitespace characters produces zero chunks.
/// A single sentence longer than the chunk size is hard-split at word
/// boundaries.
pub fn chunk_text(doc_id: &str, text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let max_chars = chunk_size.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = chunk_overlap * CHARS_PER_TOKEN;

    if text.trim().is_empty() {
        return Vec::new();
    }

    let sentences = split_sentences(text, max_chars);
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut window: Vec<Span> = Vec::new();
    let mut window_len = 0usize;

    for sentence in sentences {
        if window_len + sentence.len() > max_chars && !window.is_empty() {
            chunks.push(make_chunk(doc_id, text, &window));

            // Carry trailing sentences forward as overlap.
            let mut carried: Vec<Span> = Vec::new();
            let mut carried_len = 0usize;
            for span in window.iter().rev() {
                if carried_len + span.len() > overlap_chars {
                    break;
                }
                carried_len += span.len();
                carried.push(*span);
            }
            carried.reverse();
            window = carried;
            window_len = carried_len;
        }
        window_len += sentence.len();
        window.push(sentence);
    }

    if !window.is_empty() {
        let chunk = make_chunk(doc_id, text, &window);
        // The overlap carry can leave a final window that is a strict suffix
        // of the previous chunk; emitting it would duplicate content.
        let is_duplicate = chunks
            .last()
            .map(|prev| prev.start_offset <= chunk.start_offset && prev.end_offset >= chunk.end_offset)
            .unwrap_or(false);
        if !is_duplicate {
            chunks.push(chunk);
        }
    }

    chunks
}

/// Stable chunk identity: hex SHA-256 over doc id, offsets, and text hash.
pub fn chunk_id(doc_id: &str, start: usize, end: usize, text: &str) -> String {
    let text_hash = {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    };
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update([0]);
    hasher.update(start.to_le_bytes());
    hasher.update(end.to_le_bytes());
    hasher.update([0]);
    hasher.update(text_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn make_chunk(doc_id: &str, text: &str, spans: &[Span]) -> Chunk {
    let raw_start = spans.first().map(|s| s.start).unwrap_or(0);
    let raw_end = spans.last().map(|s| s.end).unwrap_or(0);
    let slice = &text[raw_start..raw_end];

    // Tighten offsets to the first/last non-whitespace character so the
    // recorded range matches the stored text exactly.
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    let start = raw_start + lead;
    let end = raw_end - trail;
    let body = &text[start..end];

    Chunk {
        chunk_id: chunk_id(doc_id, start, end, body),
        doc_id: doc_id.to_string(),
        text: body.to_string(),
        start_offset: start,
        end_offset: end,
        metadata: Default::default(),
    }
}

/// Split text into sentence spans. Boundaries are `.`, `!`, `?` followed by
/// whitespace, and newlines. Spans longer than `max_chars` are hard-split at
/// the nearest space before the limit.
fn split_sentences(text: &str, max_chars: usize) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        let at_terminator = matches!(b, b'.' | b'!' | b'?')
            && bytes.get(i + 1).map(|n| n.is_ascii_whitespace()).unwrap_or(true);
        let at_newline = b == b'\n';

        if at_terminator || at_newline {
            let end = if at_terminator { i + 1 } else { i };
            if text[start..end].trim().is_empty() {
                start = i + 1;
            } else {
                spans.push(Span { start, end });
                start = end;
            }
        }
        i += 1;
    }
    if start < bytes.len() && !text[start..].trim().is_empty() {
        spans.push(Span {
            start,
            end: bytes.len(),
        });
    }

    // Hard-split any sentence that alone exceeds the chunk budget.
    let mut bounded = Vec::with_capacity(spans.len());
    for span in spans {
        if span.len() <= max_chars {
            bounded.push(span);
            continue;
        }
        let mut cursor = span.start;
        while cursor < span.end {
            let mut cut = (cursor + max_chars).min(span.end);
            // Back off to a char boundary, then prefer a space boundary.
            while cut > cursor && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut < span.end {
                if let Some(pos) = text[cursor..cut].rfind(' ') {
                    if pos > 0 {
                        cut = cursor + pos + 1;
                    }
                }
            }
            if cut == cursor {
                cut = span.end;
            }
            bounded.push(Span {
                start: cursor,
                end: cut,
            });
            cursor = cut;
        }
    }
    bounded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_produces_zero_chunks() {
        assert!(chunk_text("doc1", "", 512, 50).is_empty());
        assert!(chunk_text("doc1", "   \n\t  ", 512, 50).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let text = "The Mars rover Perseverance landed in Jezero crater in 2021. \
                    Perseverance was built by NASA.";
        let chunks = chunk_text("doc1", text, 512, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, text.len());
    }

    #[test]
    fn offsets_slice_back_to_chunk_text() {
        let text = "First sentence here. Second sentence follows! Third one? \
                    And a fourth sentence to push past the boundary. A fifth sentence.";
        let chunks = chunk_text("doc1", text, 10, 2);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
        }
    }

    #[test]
    fn ids_are_stable_across_calls() {
        let text = "Alpha went home. Beta stayed out. Gamma left early. Delta arrived late.";
        let a = chunk_text("doc1", text, 8, 2);
        let b = chunk_text("doc1", text, 8, 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.chunk_id, y.chunk_id);
        }
    }

    #[test]
    fn ids_differ_across_documents() {
        let text = "Same text either way.";
        let a = chunk_text("doc1", text, 512, 0);
        let b = chunk_text("doc2", text, 512, 0);
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn overlap_repeats_trailing_sentences() {
        let text = "One sentence here. Two sentence here. Three sentence here. \
                    Four sentence here. Five sentence here. Six sentence here.";
        let chunks = chunk_text("doc1", text, 12, 6);
        assert!(chunks.len() >= 2);
        // Consecutive chunks share text because of the overlap carry.
        let first_end = &chunks[0].text[chunks[0].text.len().saturating_sub(20)..];
        assert!(
            chunks[1].text.contains(first_end.trim()),
            "expected overlap between '{}' and '{}'",
            chunks[0].text,
            chunks[1].text
        );
    }

    #[test]
    fn long_unbroken_text_is_hard_split() {
        let word = "abcdef ";
        let text = word.repeat(400);
        let chunks = chunk_text("doc1", &text, 16, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 16 * 4 + 8);
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
        }
    }

    #[test]
    fn multibyte_text_respects_char_boundaries() {
        let text = "héllo wörld ünïcode ".repeat(60);
        let chunks = chunk_text("doc1", &text, 8, 0);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
        }
    }
}
