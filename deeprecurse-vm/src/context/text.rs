//! Character-indexed text blocks
//!
//! All offsets in the context layer count Unicode scalar values, so a slice
//! never splits a UTF-8 sequence. Pure-ASCII blocks skip the char walk.

use std::sync::Arc;

/// Immutable text with a cached character count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    text: Arc<str>,
    chars: usize,
    ascii: bool,
}

impl TextBlock {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text: Arc<str> = text.into();
        let ascii = text.is_ascii();
        let chars = if ascii { text.len() } else { text.chars().count() };
        Self { text, chars, ascii }
    }

    /// Length in characters
    pub fn char_len(&self) -> usize {
        self.chars
    }

    /// Size in bytes (what the cache budget counts)
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Characters `[start, end)`, clamped to the block
    pub fn slice_chars(&self, start: usize, end: usize) -> &str {
        let end = end.min(self.chars);
        let start = start.min(end);
        if self.ascii {
            return &self.text[start..end];
        }
        let from = self.byte_offset(start);
        let to = self.byte_offset(end);
        &self.text[from..to]
    }

    fn byte_offset(&self, char_index: usize) -> usize {
        self.text
            .char_indices()
            .nth(char_index)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}

/// Clamp a requested range against a length: `0 <= start <= end <= len`
pub fn clamp_range(start: usize, end: usize, len: usize) -> (usize, usize) {
    let end = end.min(len);
    (start.min(end), end)
}
