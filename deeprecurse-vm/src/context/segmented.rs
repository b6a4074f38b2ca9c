//! Segmented context backed by an object store
//!
//! The manifest is fetched once per handle. Slices fetch every missing
//! segment concurrently (bounded by a semaphore), stitch them in offset
//! order and trim to the requested range. One failed segment fails the
//! whole slice. Concurrent misses on one segment share a single fetch.

use super::cache::{CacheStats, SegmentCache};
use super::manifest::{Manifest, SegmentDescriptor};
use super::text::{clamp_range, TextBlock};
use crate::error::{self, Error, ErrorKind, Result};
use crate::retry::{retry, RetryPolicy};
use crate::store::ObjectStore;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

/// Speculative cache warming after a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchPolicy {
    Disabled,
    /// Warm up to `segments` segments following the last one sliced
    Adjacent { segments: usize },
}

#[derive(Debug, Clone)]
pub struct SegmentedConfig {
    pub max_concurrent_fetches: usize,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    pub cache_budget_bytes: usize,
    pub prefetch: PrefetchPolicy,
}

impl Default for SegmentedConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 16,
            fetch_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            fetch_backoff: Duration::from_millis(200),
            cache_budget_bytes: 256 * 1024 * 1024,
            prefetch: PrefetchPolicy::Disabled,
        }
    }
}

impl SegmentedConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts.max(1),
            initial_backoff: self.fetch_backoff,
            max_backoff: self.fetch_backoff.saturating_mul(8),
            attempt_timeout: self.fetch_timeout,
        }
    }
}

/// Counters for one segmented handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentedStats {
    pub fetches: u64,
    pub prefetches: u64,
    pub cache: CacheStats,
}

/// Cached outcome of the one-time manifest load
type ManifestSlot = std::result::Result<Arc<Manifest>, (ErrorKind, String)>;

/// Store-backed context; cheap to clone, clones share manifest and cache
#[derive(Clone)]
pub struct SegmentedContext {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    manifest_key: String,
    manifest: OnceCell<ManifestSlot>,
    cache: Mutex<SegmentCache>,
    /// One gate per segment key with a fetch in progress
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    fetch_limit: Arc<Semaphore>,
    config: SegmentedConfig,
    fetches: AtomicU64,
    prefetches: AtomicU64,
}

impl std::fmt::Debug for SegmentedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedContext")
            .field("store", &self.inner.store.name())
            .field("manifest_key", &self.inner.manifest_key)
            .finish()
    }
}

impl SegmentedContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        manifest_key: impl Into<String>,
        config: SegmentedConfig,
    ) -> Self {
        let permits = config.max_concurrent_fetches.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                manifest_key: manifest_key.into(),
                manifest: OnceCell::new(),
                cache: Mutex::new(SegmentCache::new(config.cache_budget_bytes)),
                in_flight: Mutex::new(HashMap::new()),
                fetch_limit: Arc::new(Semaphore::new(permits)),
                config,
                fetches: AtomicU64::new(0),
                prefetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn manifest_key(&self) -> &str {
        &self.inner.manifest_key
    }

    /// The manifest, loading it on first use
    pub async fn manifest(&self) -> Result<Arc<Manifest>> {
        self.inner.manifest().await
    }

    pub async fn length(&self) -> Result<usize> {
        Ok(self.manifest().await?.total_length())
    }

    pub async fn slice(&self, start: usize, end: usize) -> Result<String> {
        let manifest = self.manifest().await?;
        let (start, end) = clamp_range(start, end, manifest.total_length());
        let range = manifest.overlapping(start, end);
        if range.is_empty() {
            return Ok(String::new());
        }

        let segments = &manifest.segments[range.clone()];
        let blocks = self.inner.load_segments(segments).await?;

        let mut out = String::new();
        for (desc, block) in segments.iter().zip(blocks.iter()) {
            let local_start = start.saturating_sub(desc.start);
            let local_end = end.min(desc.end()) - desc.start;
            out.push_str(block.slice_chars(local_start, local_end));
        }

        self.prefetch_after(&manifest, range.end);
        Ok(out)
    }

    pub fn stats(&self) -> SegmentedStats {
        SegmentedStats {
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            prefetches: self.inner.prefetches.load(Ordering::Relaxed),
            cache: self.inner.lock_cache().stats(),
        }
    }

    fn prefetch_after(&self, manifest: &Arc<Manifest>, next: usize) {
        let count = match self.inner.config.prefetch {
            PrefetchPolicy::Disabled => return,
            PrefetchPolicy::Adjacent { segments } => segments,
        };

        let upcoming: Vec<SegmentDescriptor> = {
            let cache = self.inner.lock_cache();
            manifest
                .segments
                .iter()
                .skip(next)
                .take(count)
                .filter(|desc| !cache.contains(&desc.key))
                .cloned()
                .collect()
        };
        if upcoming.is_empty() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            for desc in upcoming {
                inner.prefetches.fetch_add(1, Ordering::Relaxed);
                match inner.fetch_segment(&desc).await {
                    Ok(block) => {
                        inner.lock_cache().insert(&desc.key, block);
                    }
                    Err(err) => {
                        debug!(segment = %desc.key, error = %err, "prefetch failed");
                    }
                }
            }
        });
    }
}

impl Inner {
    fn lock_cache(&self) -> MutexGuard<'_, SegmentCache> {
        lock(&self.cache)
    }

    async fn manifest(&self) -> Result<Arc<Manifest>> {
        let slot = self
            .manifest
            .get_or_init(|| async {
                match self.load_manifest().await {
                    Ok(manifest) => Ok(Arc::new(manifest)),
                    Err(err) => {
                        warn!(key = %self.manifest_key, error = %err, "manifest load failed");
                        Err((err.kind(), err.message().to_string()))
                    }
                }
            })
            .await;

        match slot {
            Ok(manifest) => Ok(Arc::clone(manifest)),
            Err((kind, message)) => Err(Error::new(*kind, message.clone())
                .with_operation("context::manifest")
                .with_context("key", self.manifest_key.clone())),
        }
    }

    async fn load_manifest(&self) -> Result<Manifest> {
        let policy = self.config.retry_policy();
        let bytes = retry(&policy, "store::get", || self.store.get(&self.manifest_key))
            .await
            .map_err(|err| {
                let kind = err.kind();
                error::manifest_corrupt(format!("manifest unavailable ({}): {}", kind, err.message()))
                    .set_source(err)
            })?;
        let manifest = Manifest::parse(&bytes)?;
        debug!(
            key = %self.manifest_key,
            segments = manifest.len(),
            length = manifest.total_length(),
            "manifest loaded"
        );
        Ok(manifest)
    }

    /// Resolve `segments` from cache or store, preserving order
    async fn load_segments(&self, segments: &[SegmentDescriptor]) -> Result<Vec<TextBlock>> {
        let mut blocks: Vec<Option<TextBlock>> = {
            let mut cache = self.lock_cache();
            segments.iter().map(|desc| cache.get(&desc.key)).collect()
        };

        let misses: Vec<usize> = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_none())
            .map(|(i, _)| i)
            .collect();

        if !misses.is_empty() {
            debug!(
                misses = misses.len(),
                hits = segments.len() - misses.len(),
                "fetching segments"
            );
            let fetched = join_all(misses.iter().map(|&i| self.resolve_miss(&segments[i]))).await;

            let mut first_failure = None;
            for (&i, outcome) in misses.iter().zip(fetched) {
                match outcome {
                    Ok(block) => blocks[i] = Some(block),
                    Err(err) => {
                        if first_failure.is_none() {
                            first_failure = Some((i, err));
                        }
                    }
                }
            }

            if let Some((i, err)) = first_failure {
                return Err(err.with_context("segment_index", i.to_string()));
            }
        }

        blocks
            .into_iter()
            .zip(segments)
            .map(|(block, desc)| {
                block.ok_or_else(|| error::segment_unavailable(desc.key.clone(), "not resolved"))
            })
            .collect()
    }

    /// Fetch a missing segment and cache it. A caller that finds another
    /// fetch of the same key in progress waits for it and reads the cache.
    async fn resolve_miss(&self, desc: &SegmentDescriptor) -> Result<TextBlock> {
        let gate = {
            let mut table = lock(&self.in_flight);
            Arc::clone(table.entry(desc.key.clone()).or_default())
        };

        let outcome = {
            let _turn = gate.lock().await;
            let cached = self.lock_cache().get(&desc.key);
            match cached {
                Some(block) => Ok(block),
                None => {
                    let fetched = self.fetch_segment(desc).await;
                    if let Ok(block) = &fetched {
                        self.lock_cache().insert(&desc.key, block.clone());
                    }
                    fetched
                }
            }
        };

        let mut table = lock(&self.in_flight);
        // the table and this caller are the last holders
        if Arc::strong_count(&gate) <= 2 {
            table.remove(&desc.key);
        }
        outcome
    }

    /// Fetch one segment under the concurrency limit, with bounded retry
    async fn fetch_segment(&self, desc: &SegmentDescriptor) -> Result<TextBlock> {
        let _permit = self
            .fetch_limit
            .acquire()
            .await
            .map_err(|_| error::segment_unavailable(desc.key.clone(), "fetch pool closed"))?;

        let policy = self.config.retry_policy();
        let bytes = retry(&policy, "store::get", || {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            self.store.get(&desc.key)
        })
        .await
        .map_err(|err| {
            let reason = format!("{}: {}", err.kind(), err.message());
            error::segment_unavailable(desc.key.clone(), reason)
                .with_operation("context::fetch")
                .set_source(err)
        })?;

        let text = String::from_utf8(bytes)
            .map_err(|_| error::segment_unavailable(desc.key.clone(), "content is not valid UTF-8"))?;
        let block = TextBlock::new(text);
        if block.char_len() != desc.length {
            return Err(error::segment_unavailable(
                desc.key.clone(),
                format!(
                    "holds {} characters, manifest says {}",
                    block.char_len(),
                    desc.length
                ),
            ));
        }
        Ok(block)
    }
}

/// The guarded maps hold no invariant a panicking writer could break halfway
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Store wrapper that counts gets per key and can fail chosen keys
    struct CountingStore {
        inner: MemoryObjectStore,
        gets: Mutex<HashMap<String, usize>>,
        failing: Vec<String>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryObjectStore::new(),
                gets: Mutex::new(HashMap::new()),
                failing: Vec::new(),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn gets(&self, key: &str) -> usize {
            self.gets.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            *self.gets.lock().unwrap().entry(key.to_string()).or_default() += 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.iter().any(|k| k == key) {
                return Err(error::storage_failed("disk on fire"));
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.inner.put(key, bytes).await
        }
    }

    async fn seed(store: &CountingStore, segments: &[(&str, String)]) {
        let mut manifest = Manifest::new();
        for (key, text) in segments {
            store.put(key, text.clone().into_bytes()).await.unwrap();
            manifest.push(*key, text.chars().count());
        }
        store
            .put("manifest.json", manifest.to_bytes().unwrap())
            .await
            .unwrap();
    }

    fn context(store: Arc<CountingStore>, config: SegmentedConfig) -> SegmentedContext {
        SegmentedContext::new(store, "manifest.json", config)
    }

    fn quick_config() -> SegmentedConfig {
        SegmentedConfig {
            fetch_backoff: Duration::from_millis(1),
            ..SegmentedConfig::default()
        }
    }

    #[tokio::test]
    async fn test_slice_across_two_segments_fetches_each_once() {
        let seg1: String = (0..1000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let seg2: String = (0..1000).map(|i| char::from(b'A' + (i % 26) as u8)).collect();
        let store = Arc::new(CountingStore::new());
        seed(&store, &[("seg1", seg1.clone()), ("seg2", seg2.clone())]).await;

        let ctx = context(Arc::clone(&store), quick_config());
        let text = ctx.slice(500, 1500).await.unwrap();

        assert_eq!(text, format!("{}{}", &seg1[500..1000], &seg2[0..500]));
        assert_eq!(store.gets("seg1"), 1);
        assert_eq!(store.gets("seg2"), 1);
        assert_eq!(store.gets("manifest.json"), 1);
    }

    #[tokio::test]
    async fn test_one_failed_segment_fails_the_slice() {
        let mut store = CountingStore::new();
        store.failing = vec!["s2".to_string()];
        let store = Arc::new(store);
        seed(
            &store,
            &[
                ("s1", "a".repeat(10)),
                ("s2", "b".repeat(10)),
                ("s3", "c".repeat(10)),
            ],
        )
        .await;

        let ctx = context(Arc::clone(&store), quick_config());
        let err = ctx.slice(0, 30).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SegmentUnavailable);
        assert!(err.message().contains("s2"));
        // storage_failed is permanent, so no retry happened
        assert_eq!(store.gets("s2"), 1);
    }

    #[tokio::test]
    async fn test_manifest_loaded_once_and_cache_reused() {
        let store = Arc::new(CountingStore::new());
        seed(&store, &[("s1", "0123456789".to_string()), ("s2", "abcdefghij".to_string())]).await;

        let ctx = context(Arc::clone(&store), quick_config());
        assert_eq!(ctx.length().await.unwrap(), 20);
        assert_eq!(ctx.slice(8, 12).await.unwrap(), "89ab");
        assert_eq!(ctx.slice(0, 20).await.unwrap(), "0123456789abcdefghij");

        assert_eq!(store.gets("manifest.json"), 1);
        assert_eq!(store.gets("s1"), 1);
        assert_eq!(store.gets("s2"), 1);
        assert!(ctx.stats().cache.hits >= 2);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_fatal_and_sticky() {
        let store = Arc::new(CountingStore::new());
        store.put("manifest.json", b"{\"segments\": 7}".to_vec()).await.unwrap();

        let ctx = context(Arc::clone(&store), quick_config());
        let err = ctx.length().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
        let err = ctx.slice(0, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
        assert_eq!(store.gets("manifest.json"), 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_corrupt() {
        let store = Arc::new(CountingStore::new());
        let ctx = context(store, quick_config());
        let err = ctx.length().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
    }

    #[tokio::test]
    async fn test_clamps_out_of_range() {
        let store = Arc::new(CountingStore::new());
        seed(&store, &[("s1", "hello".to_string())]).await;

        let ctx = context(store, quick_config());
        assert_eq!(ctx.slice(3, 500).await.unwrap(), "lo");
        assert_eq!(ctx.slice(9, 2).await.unwrap(), "");
        assert_eq!(ctx.slice(40, 50).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_length_mismatch_is_unavailable() {
        let store = Arc::new(CountingStore::new());
        store.put("s1", b"short".to_vec()).await.unwrap();
        let manifest = Manifest::from_segments(vec![SegmentDescriptor::new("s1", 0, 9)]).unwrap();
        store.put("manifest.json", manifest.to_bytes().unwrap()).await.unwrap();

        let ctx = context(store, quick_config());
        let err = ctx.slice(0, 9).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SegmentUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_run_concurrently_within_limit() {
        let mut store = CountingStore::new();
        store.delay = Duration::from_millis(100);
        let store = Arc::new(store);
        let segments: Vec<(String, String)> =
            (0..12).map(|i| (format!("s{:02}", i), "x".repeat(4))).collect();
        let refs: Vec<(&str, String)> = segments
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        seed(&store, &refs).await;

        let config = SegmentedConfig {
            max_concurrent_fetches: 4,
            ..quick_config()
        };
        let ctx = context(Arc::clone(&store), config);
        let started = tokio::time::Instant::now();
        let text = ctx.slice(0, 48).await.unwrap();

        assert_eq!(text.len(), 48);
        assert_eq!(store.peak_in_flight.load(Ordering::SeqCst), 4);
        // manifest plus 12 fetches, 4 at a time, 100ms each; sequential would take 1.3s
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_slices_share_one_fetch_per_segment() {
        let mut store = CountingStore::new();
        store.delay = Duration::from_millis(50);
        let store = Arc::new(store);
        seed(&store, &[("s1", "a".repeat(100)), ("s2", "b".repeat(100))]).await;

        let ctx = context(Arc::clone(&store), quick_config());
        let slices = (0..20).map(|i| ctx.slice(i * 10, i * 10 + 10));
        let pieces = futures_util::future::try_join_all(slices).await.unwrap();

        assert_eq!(pieces.len(), 20);
        assert_eq!(pieces[0], "a".repeat(10));
        assert_eq!(pieces[19], "b".repeat(10));
        assert_eq!(store.gets("s1"), 1);
        assert_eq!(store.gets("s2"), 1);
        assert!(lock(&ctx.inner.in_flight).is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_warms_next_segment() {
        let store = Arc::new(CountingStore::new());
        seed(
            &store,
            &[("s1", "aaaa".to_string()), ("s2", "bbbb".to_string()), ("s3", "cccc".to_string())],
        )
        .await;

        let config = SegmentedConfig {
            prefetch: PrefetchPolicy::Adjacent { segments: 1 },
            ..quick_config()
        };
        let ctx = context(Arc::clone(&store), config);
        assert_eq!(ctx.slice(0, 4).await.unwrap(), "aaaa");

        for _ in 0..50 {
            if ctx.stats().cache.entries == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.gets("s2"), 1);
        assert_eq!(ctx.slice(4, 8).await.unwrap(), "bbbb");
        assert_eq!(store.gets("s2"), 1);
    }
}
