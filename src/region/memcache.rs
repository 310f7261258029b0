//! In-memory ordered buffer of recent mutations for one store.
//!
//! Backed by `crossbeam-skiplist::SkipMap` so readers never block writers.
//! Keys sort `(row, column, timestamp desc)`, which makes "newest versions
//! of a cell" a forward range scan. The memcache is append-only from the
//! outside: a flush swaps in a fresh instance and writes the old one out.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::key::{CellKey, CellValue};

#[derive(Debug, Default)]
pub struct Memcache {
    data: SkipMap<CellKey, CellValue>,
    size: AtomicUsize,
}

impl Memcache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed edit. Re-applying the same `(key, value)` is
    /// idempotent, which WAL replay relies on.
    pub fn apply(&self, key: CellKey, value: CellValue) {
        let bytes = key.row.len()
            + key.column.len()
            + 8
            + value.as_put().map_or(0, |v| v.len());
        self.data.insert(key, value);
        self.size.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Approximate heap footprint in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// All versions of `(row, column)` at or below `timestamp`, newest
    /// first. Tombstones are returned as-is; the caller decides shadowing.
    pub fn versions(&self, row: &[u8], column: &[u8], timestamp: u64) -> Vec<(u64, CellValue)> {
        let start = CellKey::new(row.to_vec(), column.to_vec(), timestamp);
        let end = CellKey::new(row.to_vec(), column.to_vec(), 0);
        self.data
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|entry| (entry.key().timestamp, entry.value().clone()))
            .collect()
    }

    /// Full ordered contents, for flushing.
    pub fn entries(&self) -> Vec<(CellKey, CellValue)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Owned cursor over an `Arc<Memcache>`, positioned at or after a start
/// key. Each step re-enters the skip list past the last yielded key, so the
/// cursor stays valid across concurrent inserts.
pub struct MemcacheCursor {
    memcache: Arc<Memcache>,
    position: Option<CellKey>,
    exhausted: bool,
}

impl MemcacheCursor {
    pub fn new(memcache: Arc<Memcache>, start: Option<CellKey>) -> Self {
        Self {
            memcache,
            position: start,
            exhausted: false,
        }
    }
}

impl Iterator for MemcacheCursor {
    type Item = (CellKey, CellValue);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let range = match self.position.take() {
            Some(key) => (Bound::Included(key), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        match self.memcache.data.range(range).next() {
            Some(entry) => {
                let key = entry.key().clone();
                let value = entry.value().clone();
                // Resume strictly after the yielded key next time.
                self.position = next_position(&key);
                Some((key, value))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

/// The key immediately after `key` in cell order: the next older timestamp,
/// or the next column when the version space is exhausted.
fn next_position(key: &CellKey) -> Option<CellKey> {
    if key.timestamp > 0 {
        Some(CellKey::new(
            key.row.clone(),
            key.column.clone(),
            key.timestamp - 1,
        ))
    } else {
        // ts 0 is the last version slot; step to the next column.
        let mut column = key.column.clone();
        column.push(0);
        Some(CellKey::new(key.row.clone(), column, u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_newest_first() {
        let memcache = Memcache::new();
        for ts in [1u64, 2, 3] {
            memcache.apply(
                CellKey::new(b"k1".to_vec(), b"f:c".to_vec(), ts),
                CellValue::Put(format!("v{ts}").into_bytes()),
            );
        }

        let versions = memcache.versions(b"k1", b"f:c", 3);
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0], (3, CellValue::Put(b"v3".to_vec())));
        assert_eq!(versions[2], (1, CellValue::Put(b"v1".to_vec())));

        // Upper bound excludes newer versions.
        let versions = memcache.versions(b"k1", b"f:c", 2);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].0, 2);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let memcache = Memcache::new();
        let key = CellKey::new(b"k".to_vec(), b"f:c".to_vec(), 5);
        memcache.apply(key.clone(), CellValue::Put(b"v".to_vec()));
        memcache.apply(key, CellValue::Put(b"v".to_vec()));
        assert_eq!(memcache.len(), 1);
    }

    #[test]
    fn test_cursor_walks_in_order() {
        let memcache = Arc::new(Memcache::new());
        memcache.apply(
            CellKey::new(b"a".to_vec(), b"f:c".to_vec(), 2),
            CellValue::Put(b"a2".to_vec()),
        );
        memcache.apply(
            CellKey::new(b"a".to_vec(), b"f:c".to_vec(), 1),
            CellValue::Put(b"a1".to_vec()),
        );
        memcache.apply(
            CellKey::new(b"b".to_vec(), b"f:c".to_vec(), 1),
            CellValue::Delete,
        );

        let cursor = MemcacheCursor::new(memcache.clone(), None);
        let keys: Vec<u64> = cursor.map(|(k, _)| k.timestamp).collect();
        assert_eq!(keys, vec![2, 1, 1]);

        // Start mid-way: only row b remains.
        let cursor = MemcacheCursor::new(
            memcache,
            Some(CellKey::first_in_row(b"b".to_vec())),
        );
        let rows: Vec<Vec<u8>> = cursor.map(|(k, _)| k.row).collect();
        assert_eq!(rows, vec![b"b".to_vec()]);
    }
}
