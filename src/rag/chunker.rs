//! Recursive character chunker.
//!
//! Text is first decomposed into contiguous pieces no longer than
//! `chunk_size - chunk_overlap` characters, splitting on the coarsest
//! separator present (paragraph, line, sentence, word) and hard-slicing
//! when none applies. Pieces are then merged greedily into passages of at
//! most `chunk_size` characters, each passage after the first starting with
//! the last `chunk_overlap` characters of its predecessor. Passages are
//! exact slices of the input, so dropping the overlap prefix of every
//! passage after the first and concatenating reproduces the input.

use super::types::{Document, MetadataValue, NewPassage};
use crate::core::errors::RagError;

pub const DEFAULT_SEPARATORS: [&str; 6] = ["\n\n", "\n", ". ", "! ", "? ", " "];

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

/// A passage as a character offset into the source plus its text.
#[derive(Debug, Clone, PartialEq)]
pub struct Span<'a> {
    pub start: usize,
    pub text: &'a str,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, RagError> {
        if chunk_size == 0 {
            return Err(RagError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_spans(text)
            .into_iter()
            .map(|span| span.text.to_string())
            .collect()
    }

    /// Splits a document and tags each passage with its position.
    pub fn chunk_document(&self, document: &Document) -> Vec<NewPassage> {
        self.split_spans(&document.text)
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let mut metadata = document.metadata.clone();
                metadata.insert("chunk_index".to_string(), MetadataValue::from(index));
                metadata.insert("start_offset".to_string(), MetadataValue::from(span.start));
                NewPassage {
                    text: span.text.to_string(),
                    metadata,
                }
            })
            .collect()
    }

    pub fn split_spans<'a>(&self, text: &'a str) -> Vec<Span<'a>> {
        if text.is_empty() {
            return Vec::new();
        }

        let step = self.chunk_size - self.chunk_overlap;
        let mut pieces = Vec::new();
        self.decompose(text, 0, step, &mut pieces);

        let offsets = char_byte_offsets(text);
        self.merge(&pieces)
            .into_iter()
            .map(|(start, len)| Span {
                start,
                text: &text[offsets[start]..offsets[start + len]],
            })
            .collect()
    }

    /// Inverse of `split` for passages produced with this chunker's overlap.
    pub fn reassemble(&self, passages: &[String]) -> String {
        let mut text = String::new();
        for (index, passage) in passages.iter().enumerate() {
            if index == 0 {
                text.push_str(passage);
            } else {
                text.extend(passage.chars().skip(self.chunk_overlap));
            }
        }
        text
    }

    fn decompose<'a>(&self, text: &'a str, first_separator: usize, step: usize, out: &mut Vec<&'a str>) {
        if char_len(text) <= step {
            out.push(text);
            return;
        }

        for (index, separator) in self.separators.iter().enumerate().skip(first_separator) {
            if !text.contains(separator.as_str()) {
                continue;
            }
            for part in text.split_inclusive(separator.as_str()) {
                if char_len(part) <= step {
                    out.push(part);
                } else {
                    self.decompose(part, index + 1, step, out);
                }
            }
            return;
        }

        hard_slice(text, step, out);
    }

    /// Greedy merge over piece lengths; returns `(char_start, char_len)`.
    fn merge(&self, pieces: &[&str]) -> Vec<(usize, usize)> {
        let mut passages = Vec::new();
        let mut start = 0;
        let mut len = 0;

        for piece in pieces {
            let piece_len = char_len(piece);
            if len > 0 && len + piece_len > self.chunk_size {
                passages.push((start, len));
                // Pieces never exceed `chunk_size - overlap`, so `len > overlap` here.
                start = start + len - self.chunk_overlap;
                len = self.chunk_overlap;
            }
            len += piece_len;
        }
        if len > 0 {
            passages.push((start, len));
        }
        passages
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn char_byte_offsets(text: &str) -> Vec<usize> {
    let mut offsets: Vec<usize> = text.char_indices().map(|(byte, _)| byte).collect();
    offsets.push(text.len());
    offsets
}

fn hard_slice<'a>(text: &'a str, step: usize, out: &mut Vec<&'a str>) {
    let offsets = char_byte_offsets(text);
    let chars = offsets.len() - 1;
    let mut start = 0;
    while start < chars {
        let end = (start + step).min(chars);
        out.push(&text[offsets[start]..offsets[end]]);
        start = end;
    }
}
