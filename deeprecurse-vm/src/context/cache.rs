//! LRU segment cache bounded by a byte budget
//!
//! Entries are whole segments; eviction never splits one. A segment larger
//! than the entire budget is simply not cached.

use super::text::TextBlock;
use lru::LruCache;

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes: usize,
    pub entries: usize,
}

#[derive(Debug)]
pub struct SegmentCache {
    budget_bytes: usize,
    used_bytes: usize,
    /// Recency order is kept by the LRU list; the byte budget is enforced here
    entries: LruCache<String, TextBlock>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl SegmentCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
            entries: LruCache::unbounded(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up a segment, refreshing its recency
    pub fn get(&mut self, key: &str) -> Option<TextBlock> {
        match self.entries.get(key) {
            Some(content) => {
                self.hits += 1;
                Some(content.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Insert a segment, evicting least-recently-used entries to fit.
    ///
    /// Re-inserting an existing key only refreshes it, so two concurrent
    /// fetches of the same miss leave one entry behind.
    pub fn insert(&mut self, key: &str, content: TextBlock) {
        if self.entries.contains(key) {
            self.entries.promote(key);
            return;
        }

        let size = content.byte_len();
        if size > self.budget_bytes {
            return;
        }

        while self.used_bytes + size > self.budget_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.used_bytes -= evicted.byte_len();
                    self.evictions += 1;
                }
                None => break,
            }
        }

        self.used_bytes += size;
        self.entries.put(key.to_string(), content);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            bytes: self.used_bytes,
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: usize) -> TextBlock {
        TextBlock::new("x".repeat(n))
    }

    #[test]
    fn test_hit_and_miss() {
        let mut cache = SegmentCache::new(100);
        assert!(cache.get("a").is_none());
        cache.insert("a", block(10));
        assert_eq!(cache.get("a").unwrap().char_len(), 10);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes, 10);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = SegmentCache::new(30);
        cache.insert("a", block(10));
        cache.insert("b", block(10));
        cache.insert("c", block(10));

        // touch a so b becomes the oldest
        cache.get("a");
        cache.insert("d", block(10));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.stats().bytes, 30);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_whole_segments_only() {
        let mut cache = SegmentCache::new(25);
        cache.insert("a", block(10));
        cache.insert("b", block(10));
        cache.insert("big", block(20));

        // both small entries had to go to fit the large one
        assert!(!cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("big"));
        assert_eq!(cache.stats().bytes, 20);
    }

    #[test]
    fn test_oversized_segment_not_cached() {
        let mut cache = SegmentCache::new(5);
        cache.insert("a", block(3));
        cache.insert("huge", block(50));
        assert!(cache.contains("a"));
        assert!(!cache.contains("huge"));
    }

    #[test]
    fn test_double_insert_is_idempotent() {
        let mut cache = SegmentCache::new(100);
        cache.insert("a", block(10));
        cache.insert("a", block(10));
        assert_eq!(cache.stats().bytes, 10);
        assert_eq!(cache.stats().entries, 1);
    }
}
