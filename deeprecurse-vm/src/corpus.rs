//! Append-only corpus writer
//!
//! New text is cut into segments, the segments are written, and only then
//! is the extended manifest written. A reader that loads the manifest
//! therefore never sees a descriptor whose segment is missing.
//!
//! Uploaded transcripts open with a `[SESSION UPLOAD]` header line; the
//! sandbox navigates sessions by these headers.

use crate::context::{manifest_key, segment_key, Manifest};
use crate::error::{self, ErrorKind, Result};
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Default segment size in characters
pub const DEFAULT_SEGMENT_CHARS: usize = 1024 * 1024;

/// First token of a session header line
pub const SESSION_HEADER_PREFIX: &str = "[SESSION UPLOAD]";

/// Fields of `[SESSION UPLOAD] <session> | developer=<name> | <timestamp>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session: String,
    pub developer: Option<String>,
    pub uploaded_at: Option<String>,
}

impl SessionHeader {
    /// Parse a header line; `None` for any other line
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim_end().strip_prefix(SESSION_HEADER_PREFIX)?;
        let mut parts = rest.split('|').map(str::trim);
        let session = parts.next().filter(|s| !s.is_empty())?.to_string();

        let mut header = SessionHeader {
            session,
            developer: None,
            uploaded_at: None,
        };
        for part in parts.filter(|p| !p.is_empty()) {
            match part.strip_prefix("developer=") {
                Some(name) => header.developer = Some(name.to_string()),
                None if header.uploaded_at.is_none() => header.uploaded_at = Some(part.to_string()),
                None => {}
            }
        }
        Some(header)
    }

    pub fn render(&self) -> String {
        let mut line = format!("{} {}", SESSION_HEADER_PREFIX, self.session);
        if let Some(developer) = &self.developer {
            line.push_str(&format!(" | developer={}", developer));
        }
        if let Some(at) = &self.uploaded_at {
            line.push_str(&format!(" | {}", at));
        }
        line
    }
}

/// Writes appended text into a named corpus
pub struct CorpusWriter {
    store: Arc<dyn ObjectStore>,
    corpus: String,
    segment_chars: usize,
}

impl CorpusWriter {
    pub fn new(store: Arc<dyn ObjectStore>, corpus: impl Into<String>) -> Self {
        Self {
            store,
            corpus: corpus.into(),
            segment_chars: DEFAULT_SEGMENT_CHARS,
        }
    }

    pub fn with_segment_chars(mut self, segment_chars: usize) -> Self {
        self.segment_chars = segment_chars.max(1);
        self
    }

    pub fn corpus(&self) -> &str {
        &self.corpus
    }

    /// Current manifest; a corpus that was never written is empty
    pub async fn manifest(&self) -> Result<Manifest> {
        match self.store.get(&manifest_key(&self.corpus)).await {
            Ok(bytes) => Manifest::parse(&bytes),
            Err(err) if err.kind() == ErrorKind::StorageNotFound => Ok(Manifest::new()),
            Err(err) => Err(err),
        }
    }

    /// Append `text` and return the extended manifest
    pub async fn append(&self, text: &str) -> Result<Manifest> {
        if text.is_empty() {
            return Err(error::invalid_argument("cannot append empty text")
                .with_context("corpus", self.corpus.clone()));
        }

        let mut manifest = self.manifest().await?;
        let first_index = manifest.len();

        for (offset, piece) in split_segments(text, self.segment_chars).into_iter().enumerate() {
            let key = segment_key(&self.corpus, first_index + offset);
            let length = piece.chars().count();
            self.store.put(&key, piece.as_bytes().to_vec()).await?;
            manifest.push(key, length);
        }

        manifest.validate()?;
        let bytes = manifest.to_bytes()?;
        self.store.put(&manifest_key(&self.corpus), bytes).await?;

        info!(
            corpus = %self.corpus,
            segments = manifest.len(),
            length = manifest.total_length(),
            "corpus appended"
        );
        Ok(manifest)
    }
}

/// Cut `text` into pieces of at most `max_chars` characters, breaking after
/// the last newline of a window when there is one.
pub fn split_segments(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(byte, _)| byte)
            .unwrap_or(rest.len());

        if window_end == rest.len() {
            pieces.push(rest);
            break;
        }

        let cut = match rest[..window_end].rfind('\n') {
            Some(newline) if newline > 0 => newline + 1,
            _ => window_end,
        };
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }

    pieces
}
