//! Recursive text chunker.
//!
//! Splits page text into chunks of roughly `chunk_size` characters with
//! `overlap` characters carried over between consecutive chunks. Splitting
//! prefers paragraph boundaries, then line breaks, then sentence ends, then
//! spaces; a boundary never lands inside a word token. Chunks keep the page
//! number of the page they were cut from.
//!
//! Chunk identity is `H(catalog_id, chunk_index)` and the content hash is
//! SHA-256 of the text, so re-chunking identical bytes reproduces identical
//! rows.

use crate::ids::{self, Id};
use crate::loader::DocPage;
use crate::models::Chunk;

/// Boundary preference order for the recursive split.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
        }
    }
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size / 2),
        }
    }

    /// Chunk a full document. Indices are contiguous across pages, starting
    /// at 0.
    pub fn chunk_document(&self, catalog_id: Id, pages: &[DocPage]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for page in pages {
            for piece in self.split_text(&page.text) {
                let index = chunks.len();
                chunks.push(make_chunk(catalog_id, index, &piece, page.page_number));
            }
        }
        chunks
    }

    /// Split one text into pieces of at most `chunk_size` characters with
    /// overlap between consecutive pieces.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if trimmed.chars().count() <= self.chunk_size {
            return vec![trimmed.to_string()];
        }

        let mut pieces = Vec::new();
        let mut rest = trimmed;
        loop {
            if rest.chars().count() <= self.chunk_size {
                let tail = rest.trim();
                if !tail.is_empty() {
                    pieces.push(tail.to_string());
                }
                break;
            }

            let hard_limit = byte_index_for_chars(rest, self.chunk_size);
            let cut = best_boundary(rest, hard_limit);
            let piece = rest[..cut].trim();
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }

            // Step back by the overlap, re-aligned to a word boundary so a
            // chunk never starts mid-token.
            let back_chars = cut_chars(rest, cut).saturating_sub(self.overlap);
            let back_bytes = byte_index_for_chars(rest, back_chars);
            let mut resume = next_word_start(rest, back_bytes);
            if resume == 0 {
                // No safe overlap start; continue without overlap.
                resume = cut;
            }
            if resume >= rest.len() {
                break;
            }
            rest = rest[resume..].trim_start();
            if rest.is_empty() {
                break;
            }
        }
        pieces
    }
}

/// Character count of `text[..byte_idx]`.
fn cut_chars(text: &str, byte_idx: usize) -> usize {
    text[..byte_idx].chars().count()
}

/// Byte index after `n` characters.
fn byte_index_for_chars(text: &str, n: usize) -> usize {
    match text.char_indices().nth(n) {
        Some((idx, _)) => idx,
        None => text.len(),
    }
}

/// Find the best split point at or before `limit`, trying each separator in
/// preference order. Falls back to the nearest char boundary when the text
/// has no separators at all.
fn best_boundary(text: &str, limit: usize) -> usize {
    let window = &text[..limit];
    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            // Keep the separator with the left piece.
            let cut = pos + sep.len();
            // A cut in the first tenth wastes the window.
            if cut > limit / 10 {
                return cut;
            }
        }
    }
    limit
}

/// First byte index at or after `from` that starts a word.
fn next_word_start(text: &str, from: usize) -> usize {
    let mut idx = from.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    // If `idx` lands mid-token, advance past the rest of the token.
    let prev_is_word = idx > 0
        && text[..idx]
            .chars()
            .next_back()
            .map(|c| !c.is_whitespace())
            .unwrap_or(false);
    if prev_is_word {
        while let Some(c) = text[idx..].chars().next() {
            if c.is_whitespace() {
                break;
            }
            idx += c.len_utf8();
        }
    }
    // Then skip whitespace to the next token start.
    while let Some(c) = text[idx..].chars().next() {
        if !c.is_whitespace() {
            break;
        }
        idx += c.len_utf8();
    }
    idx
}

fn make_chunk(catalog_id: Id, index: usize, text: &str, page_number: Option<u32>) -> Chunk {
    Chunk {
        id: ids::chunk_id(catalog_id, index),
        catalog_id,
        chunk_index: index,
        text: text.to_string(),
        hash: ids::content_hash(text.as_bytes()),
        page_number,
        concept_ids: Vec::new(),
        concept_density: 0.0,
        vector: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str, n: Option<u32>) -> DocPage {
        DocPage {
            page_number: n,
            text: text.to_string(),
        }
    }

    #[test]
    fn short_text_single_chunk() {
        let chunker = TextChunker::default();
        let chunks = chunker.chunk_document(1, &[page("Hello, world!", Some(1))]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].page_number, Some(1));
    }

    #[test]
    fn empty_page_produces_no_chunks() {
        let chunker = TextChunker::default();
        let chunks = chunker.chunk_document(1, &[page("   \n ", Some(1))]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn long_text_splits_under_limit() {
        let chunker = TextChunker::new(100, 10);
        let text = (0..40)
            .map(|i| format!("Sentence number {} here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = chunker.split_text(&text);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(
                piece.chars().count() <= 100,
                "piece too long: {}",
                piece.len()
            );
        }
    }

    #[test]
    fn no_split_inside_word() {
        let chunker = TextChunker::new(50, 5);
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima";
        let words: Vec<&str> = text.split_whitespace().collect();
        for piece in chunker.split_text(text) {
            for token in piece.split_whitespace() {
                assert!(
                    words.contains(&token),
                    "token '{}' was cut mid-word",
                    token
                );
            }
        }
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let chunker = TextChunker::new(40, 0);
        let text = "First paragraph content here.\n\nSecond paragraph content here.";
        let pieces = chunker.split_text(text);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0], "First paragraph content here.");
        assert_eq!(pieces[1], "Second paragraph content here.");
    }

    #[test]
    fn indices_contiguous_across_pages() {
        let chunker = TextChunker::new(50, 5);
        let long = "word ".repeat(60);
        let chunks = chunker.chunk_document(
            7,
            &[page(&long, Some(1)), page(&long, Some(2))],
        );
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
        assert!(chunks.iter().any(|c| c.page_number == Some(2)));
    }

    #[test]
    fn deterministic_ids_and_hashes() {
        let chunker = TextChunker::default();
        let pages = [page("Alpha beta gamma.", Some(1))];
        let a = chunker.chunk_document(42, &pages);
        let b = chunker.chunk_document(42, &pages);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.hash, y.hash);
        }
    }
}
