//! Segment manifest
//!
//! Ordered index from corpus offsets to stored segments. Offsets are in
//! characters and must tile the corpus exactly: the first segment starts at
//! 0 and each segment starts where the previous one ends.

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};

/// Current on-disk manifest format
pub const MANIFEST_VERSION: u32 = 1;

/// One independently fetchable chunk of the corpus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub key: String,
    pub start: usize,
    pub length: usize,
}

impl SegmentDescriptor {
    pub fn new(key: impl Into<String>, start: usize, length: usize) -> Self {
        Self {
            key: key.into(),
            start,
            length,
        }
    }

    /// Exclusive end offset
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: u32,
    pub segments: Vec<SegmentDescriptor>,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Empty manifest (zero-length corpus)
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            segments: Vec::new(),
        }
    }

    /// Build and validate a manifest from descriptors
    pub fn from_segments(segments: Vec<SegmentDescriptor>) -> Result<Self> {
        let manifest = Self {
            version: MANIFEST_VERSION,
            segments,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse stored bytes; any decoding or layout problem is `ManifestCorrupt`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| error::manifest_corrupt(format!("invalid manifest json: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| error::serialization_error(e.to_string()))
    }

    /// Check the tiling invariant
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(error::manifest_corrupt(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }

        let mut expected = 0usize;
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.key.is_empty() {
                return Err(error::manifest_corrupt(format!("segment {} has an empty key", i)));
            }
            if seg.length == 0 {
                return Err(error::manifest_corrupt(format!(
                    "segment {} ('{}') is empty",
                    i, seg.key
                ))
                .with_context("segment", seg.key.clone()));
            }
            if seg.start != expected {
                let what = if seg.start > expected { "gap" } else { "overlap" };
                return Err(error::manifest_corrupt(format!(
                    "{} before segment {} ('{}'): starts at {}, expected {}",
                    what, i, seg.key, seg.start, expected
                ))
                .with_context("segment", seg.key.clone()));
            }
            expected = seg
                .start
                .checked_add(seg.length)
                .ok_or_else(|| error::manifest_corrupt("segment offsets overflow"))?;
        }
        Ok(())
    }

    /// Total corpus length in characters
    pub fn total_length(&self) -> usize {
        self.segments.last().map(|s| s.end()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Index range of the segments overlapping `[start, end)`
    pub fn overlapping(&self, start: usize, end: usize) -> std::ops::Range<usize> {
        if start >= end {
            return 0..0;
        }
        let first = self.segments.partition_point(|s| s.end() <= start);
        let last = self.segments.partition_point(|s| s.start < end);
        first..last.max(first)
    }

    /// Append a new segment at the end of the corpus
    pub fn push(&mut self, key: impl Into<String>, length: usize) {
        let start = self.total_length();
        self.segments.push(SegmentDescriptor::new(key, start, length));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn two_segments() -> Manifest {
        Manifest::from_segments(vec![
            SegmentDescriptor::new("seg1", 0, 1000),
            SegmentDescriptor::new("seg2", 1000, 1000),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_roundtrip() {
        let manifest = two_segments();
        let bytes = manifest.to_bytes().unwrap();
        assert_eq!(Manifest::parse(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_version_defaults_when_absent() {
        let json = br#"{"segments":[{"key":"a","start":0,"length":3}]}"#;
        let manifest = Manifest::parse(json).unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.total_length(), 3);
    }

    #[test]
    fn test_rejects_gap() {
        let err = Manifest::from_segments(vec![
            SegmentDescriptor::new("a", 0, 10),
            SegmentDescriptor::new("b", 12, 10),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
        assert!(err.message().contains("gap"));
    }

    #[test]
    fn test_rejects_overlap_and_bad_start() {
        let err = Manifest::from_segments(vec![
            SegmentDescriptor::new("a", 0, 10),
            SegmentDescriptor::new("b", 5, 10),
        ])
        .unwrap_err();
        assert!(err.message().contains("overlap"));

        let err = Manifest::from_segments(vec![SegmentDescriptor::new("a", 3, 10)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
    }

    #[test]
    fn test_rejects_empty_segment_and_garbage() {
        let err = Manifest::from_segments(vec![SegmentDescriptor::new("a", 0, 0)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);

        let err = Manifest::parse(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestCorrupt);
    }

    #[test]
    fn test_overlapping() {
        let manifest = two_segments();
        assert_eq!(manifest.overlapping(500, 1500), 0..2);
        assert_eq!(manifest.overlapping(0, 1000), 0..1);
        assert_eq!(manifest.overlapping(1000, 1001), 1..2);
        assert_eq!(manifest.overlapping(999, 1000), 0..1);
        assert_eq!(manifest.overlapping(700, 700), 0..0);
        assert_eq!(manifest.overlapping(2000, 3000), 2..2);
    }

    #[test]
    fn test_push_extends() {
        let mut manifest = Manifest::new();
        manifest.push("a", 5);
        manifest.push("b", 7);
        assert_eq!(manifest.total_length(), 12);
        assert_eq!(manifest.segments[1].start, 5);
        manifest.validate().unwrap();
    }
}
