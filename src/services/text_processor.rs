// Text Processing Service
// Chunking, sentence-boundary scans and context extraction

use crate::models::{Chunk, Span};
use crate::services::detection::error::AnalysisError;

/// Returns true when `chars[idx]` ends a sentence.
///
/// `.` between two ASCII digits (`3.5`, `1.000`) is a decimal point, not a terminator.
pub fn is_sentence_terminator(chars: &[char], idx: usize) -> bool {
    match chars.get(idx) {
        Some('!') | Some('?') => true,
        Some('.') => {
            let prev_digit = idx > 0 && chars[idx - 1].is_ascii_digit();
            let next_digit = chars.get(idx + 1).is_some_and(|c| c.is_ascii_digit());
            !(prev_digit && next_digit)
        }
        _ => false,
    }
}

/// Chunk cut points: sentence terminators plus newlines.
pub fn is_chunk_break(chars: &[char], idx: usize) -> bool {
    chars.get(idx) == Some(&'\n') || is_sentence_terminator(chars, idx)
}

/// Walks left from `from` (inclusive) down to `floor` (inclusive) and returns the first
/// index accepted by `is_break`.
pub fn scan_backward<F>(chars: &[char], from: usize, floor: usize, is_break: F) -> Option<usize>
where
    F: Fn(&[char], usize) -> bool,
{
    if chars.is_empty() || floor > from {
        return None;
    }
    let from = from.min(chars.len() - 1);
    (floor..=from).rev().find(|&i| is_break(chars, i))
}

/// Walks right from `from` (inclusive) up to `ceil` (exclusive) and returns the first
/// index accepted by `is_break`.
pub fn scan_forward<F>(chars: &[char], from: usize, ceil: usize, is_break: F) -> Option<usize>
where
    F: Fn(&[char], usize) -> bool,
{
    let ceil = ceil.min(chars.len());
    (from..ceil).find(|&i| is_break(chars, i))
}

/// Byte offset of every char, plus a trailing `text.len()` sentinel.
fn char_byte_offsets(text: &str) -> Vec<usize> {
    let mut offsets: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    offsets.push(text.len());
    offsets
}

/// Number of chars that start before `byte`. Tolerates offsets inside a multi-byte char.
pub fn byte_to_char_index(text: &str, byte: usize) -> usize {
    text.char_indices().take_while(|(b, _)| *b < byte).count()
}

/// Byte offset of the `char_offset`-th char, `None` past the end.
pub fn char_to_byte_index(text: &str, char_offset: usize) -> Option<usize> {
    if char_offset == 0 {
        return Some(0);
    }
    let mut current = 0usize;
    for (byte_idx, _) in text.char_indices() {
        if current == char_offset {
            return Some(byte_idx);
        }
        current += 1;
    }
    if current == char_offset {
        Some(text.len())
    } else {
        None
    }
}

/// Leading `max_chars` chars of `text` as a borrowed slice.
pub fn prefix_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Whitespace-delimited token count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// ============ Chunker ============

/// Splits text into overlapping, sentence-respecting chunks. Sizes count chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_chunk_size: usize,
    overlap_size: usize,
}

impl Chunker {
    pub fn new(max_chunk_size: usize, overlap_size: usize) -> Result<Self, AnalysisError> {
        if max_chunk_size == 0 {
            return Err(AnalysisError::Configuration(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if overlap_size >= max_chunk_size {
            return Err(AnalysisError::Configuration(format!(
                "overlap_size ({}) must be smaller than max_chunk_size ({})",
                overlap_size, max_chunk_size
            )));
        }
        Ok(Self {
            max_chunk_size,
            overlap_size,
        })
    }

    pub fn split(&self, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let offsets = char_byte_offsets(text);
        let total = chars.len();
        let mut chunks = Vec::new();
        if total == 0 {
            return chunks;
        }

        let mut start = 0usize;
        loop {
            let mut end = (start + self.max_chunk_size).min(total);
            if end < total {
                // a break inside the overlap zone would stall the next window
                let floor = start + self.overlap_size.max(1);
                if let Some(brk) = scan_backward(&chars, end - 1, floor, is_chunk_break) {
                    end = brk + 1;
                }
            }

            let (start_b, end_b) = (offsets[start], offsets[end]);
            chunks.push(Chunk {
                index: chunks.len(),
                start: start_b,
                end: end_b,
                text: text[start_b..end_b].to_string(),
            });

            if end >= total {
                break;
            }
            let next = end.saturating_sub(self.overlap_size);
            start = if next > start { next } else { end };
        }

        chunks
    }
}

// ============ Context Extractor ============

/// Expands `span` (byte offsets into `text`) by `radius` chars on each side, then grows
/// outward to the nearest sentence terminators. The left terminator is excluded and the
/// right one kept, so the snippet reads as whole sentences.
pub fn extract_context(text: &str, span: Span, radius: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return String::new();
    }

    let match_start = byte_to_char_index(text, span.start).min(total);
    let match_end = byte_to_char_index(text, span.end).clamp(match_start, total);

    let window_start = match_start.saturating_sub(radius).min(total - 1);
    let left = match scan_backward(&chars, window_start, 0, is_sentence_terminator) {
        Some(idx) => (idx + 1).min(match_start),
        None => 0,
    };

    let window_end = (match_end + radius).min(total);
    let right = match scan_forward(&chars, window_end, total, is_sentence_terminator) {
        Some(idx) => idx + 1,
        None => total,
    };

    chars[left..right.max(left)]
        .iter()
        .collect::<String>()
        .trim()
        .to_string()
}
