//! # Context Handles
//!
//! Uniform `length()` / `slice(start, end)` access to a text corpus,
//! whether it lives in memory or in a segmented object store.
//!
//! Offsets are character positions. Out-of-range requests are clamped
//! (`0 <= start <= end <= length()`), never rejected.

pub mod cache;
pub mod manifest;
pub mod segmented;
pub mod text;

pub use cache::{CacheStats, SegmentCache};
pub use manifest::{Manifest, SegmentDescriptor, MANIFEST_VERSION};
pub use segmented::{PrefetchPolicy, SegmentedConfig, SegmentedContext, SegmentedStats};
pub use text::{clamp_range, TextBlock};

use crate::error::Result;
use crate::store::ObjectStore;
use std::sync::Arc;

/// Manifest key for a named corpus
pub fn manifest_key(corpus: &str) -> String {
    format!("{}/manifest.json", corpus.trim_matches('/'))
}

/// Key of the `index`-th segment of a corpus
pub fn segment_key(corpus: &str, index: usize) -> String {
    format!("{}/segments/{:08}.txt", corpus.trim_matches('/'), index)
}

/// Which storage a handle reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Buffer,
    Segmented,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Buffer => "buffer",
            ContextKind::Segmented => "segmented",
        }
    }
}

/// Random-access view over a corpus. Clones share the same backing data.
#[derive(Debug, Clone)]
pub enum ContextHandle {
    Buffer(TextBlock),
    Segmented(SegmentedContext),
}

impl ContextHandle {
    /// In-memory context
    pub fn from_text(text: impl Into<Arc<str>>) -> Self {
        ContextHandle::Buffer(TextBlock::new(text))
    }

    /// Store-backed context for a named corpus
    pub fn segmented(store: Arc<dyn ObjectStore>, corpus: &str, config: SegmentedConfig) -> Self {
        ContextHandle::Segmented(SegmentedContext::new(store, manifest_key(corpus), config))
    }

    pub fn kind(&self) -> ContextKind {
        match self {
            ContextHandle::Buffer(_) => ContextKind::Buffer,
            ContextHandle::Segmented(_) => ContextKind::Segmented,
        }
    }

    /// Total length in characters. Segmented handles load the manifest here.
    pub async fn length(&self) -> Result<usize> {
        match self {
            ContextHandle::Buffer(block) => Ok(block.char_len()),
            ContextHandle::Segmented(ctx) => ctx.length().await,
        }
    }

    /// Ranges that cover the context in storage order: one per segment for
    /// a store-backed handle, one for a buffer. Reading them in turn keeps a
    /// single segment in flight.
    pub async fn windows(&self) -> Result<Vec<(usize, usize)>> {
        match self {
            ContextHandle::Buffer(block) if block.char_len() == 0 => Ok(Vec::new()),
            ContextHandle::Buffer(block) => Ok(vec![(0, block.char_len())]),
            ContextHandle::Segmented(ctx) => Ok(ctx
                .manifest()
                .await?
                .segments
                .iter()
                .map(|desc| (desc.start, desc.end()))
                .collect()),
        }
    }

    /// Characters in `[start, end)` after clamping
    pub async fn slice(&self, start: usize, end: usize) -> Result<String> {
        match self {
            ContextHandle::Buffer(block) => Ok(block.slice_chars(start, end).to_string()),
            ContextHandle::Segmented(ctx) => ctx.slice(start, end).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    const CORPUS: &str = "[USER] why postgres?\n---\n[ASSISTANT] we needed jsonb and \
                          row-level security. ünïcödé → fine.\n---\n[USER] and redis?\n";

    /// Store the corpus split at the given character boundaries
    async fn segmented_copy(text: &str, cuts: &[usize]) -> ContextHandle {
        let store = Arc::new(MemoryObjectStore::new());
        let chars: Vec<char> = text.chars().collect();
        let mut manifest = Manifest::new();
        let mut bounds = vec![0];
        bounds.extend_from_slice(cuts);
        bounds.push(chars.len());

        for (i, pair) in bounds.windows(2).enumerate() {
            let piece: String = chars[pair[0]..pair[1]].iter().collect();
            let key = segment_key("t", i);
            store.put(&key, piece.into_bytes()).await.unwrap();
            manifest.push(key, pair[1] - pair[0]);
        }
        store
            .put(&manifest_key("t"), manifest.to_bytes().unwrap())
            .await
            .unwrap();

        ContextHandle::segmented(store, "t", SegmentedConfig::default())
    }

    #[tokio::test]
    async fn test_segmented_matches_buffer() {
        let buffer = ContextHandle::from_text(CORPUS);
        let length = buffer.length().await.unwrap();
        let segmented = segmented_copy(CORPUS, &[7, 8, 30, 61, 90]).await;
        assert_eq!(segmented.length().await.unwrap(), length);

        for (a, b) in [(0, length), (0, 1), (5, 9), (29, 62), (60, 61), (7, 8), (88, length), (3, 3)] {
            assert_eq!(
                segmented.slice(a, b).await.unwrap(),
                buffer.slice(a, b).await.unwrap(),
                "slice({}, {})",
                a,
                b
            );
        }
    }

    #[tokio::test]
    async fn test_slices_compose() {
        let segmented = segmented_copy(CORPUS, &[10, 50, 51, 80]).await;
        let length = segmented.length().await.unwrap();

        for (a, b, c) in [(0, 10, 20), (5, 50, 51), (49, 52, length), (0, 0, length)] {
            let left = segmented.slice(a, b).await.unwrap();
            let right = segmented.slice(b, c).await.unwrap();
            let whole = segmented.slice(a, c).await.unwrap();
            assert_eq!(format!("{}{}", left, right), whole);
        }
    }

    #[tokio::test]
    async fn test_buffer_clamps() {
        let ctx = ContextHandle::from_text("abcdef");
        assert_eq!(ctx.kind(), ContextKind::Buffer);
        assert_eq!(ctx.slice(4, 100).await.unwrap(), "ef");
        assert_eq!(ctx.slice(5, 2).await.unwrap(), "");
        assert_eq!(ctx.slice(100, 200).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_windows_tile_the_context() {
        let segmented = segmented_copy(CORPUS, &[10, 50]).await;
        let length = segmented.length().await.unwrap();
        assert_eq!(segmented.windows().await.unwrap(), vec![(0, 10), (10, 50), (50, length)]);

        assert_eq!(ContextHandle::from_text("abc").windows().await.unwrap(), vec![(0, 3)]);
        assert!(ContextHandle::from_text("").windows().await.unwrap().is_empty());
    }

    #[test]
    fn test_keys() {
        assert_eq!(manifest_key("/team/"), "team/manifest.json");
        assert_eq!(segment_key("team", 12), "team/segments/00000012.txt");
    }
}
