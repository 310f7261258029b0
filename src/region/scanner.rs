//! Server-side scan cursors over one region.
//!
//! A scanner merges every read source of the selected stores (memcaches
//! and store files) into a single cursor ordered `(row, column,
//! timestamp desc)`, then reduces it row by row: per `(row, column)` the
//! newest version at or below the scan timestamp wins, and a tombstone in
//! that position hides the column entirely.

use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::key::{CellKey, CellValue, ColumnMatcher};
use crate::region::memcache::MemcacheCursor;
use crate::region::store::{MergeCursor, Store};

/// Row predicate applied while scanning; `true` means skip the row.
pub trait RowFilter: Send {
    fn filter_row(&self, row: &[u8]) -> bool;
}

/// The per-row result: column name to newest visible value.
pub type RowResult = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct RegionScanner {
    merge: MergeCursor,
    matcher: ColumnMatcher,
    timestamp: u64,
    filter: Option<Box<dyn RowFilter>>,
    end_key: Vec<u8>,
    peeked: Option<(CellKey, CellValue)>,
    done: bool,
}

impl RegionScanner {
    /// Builds a scanner over `stores`, positioned at `start_row`. The
    /// caller has already narrowed `stores` to the matcher's families.
    pub(crate) fn new(
        stores: &[&Store],
        matcher: ColumnMatcher,
        start_row: Vec<u8>,
        timestamp: u64,
        filter: Option<Box<dyn RowFilter>>,
        end_key: Vec<u8>,
    ) -> Result<Self> {
        let start = if start_row.is_empty() {
            None
        } else {
            Some(CellKey::first_in_row(start_row))
        };

        let mut sources: Vec<Box<dyn Iterator<Item = Result<(CellKey, CellValue)>> + Send>> =
            Vec::new();
        for store in stores {
            let (memcaches, files) = store.read_sources()?;
            for memcache in memcaches {
                let cursor = MemcacheCursor::new(memcache, start.clone());
                sources.push(Box::new(cursor.map(Ok)));
            }
            for file in files {
                sources.push(file.scan(start.as_ref())?);
            }
        }

        Ok(Self {
            merge: MergeCursor::new(sources),
            matcher,
            timestamp,
            filter,
            end_key,
            peeked: None,
            done: false,
        })
    }

    fn next_cell(&mut self) -> Result<Option<(CellKey, CellValue)>> {
        if let Some(cell) = self.peeked.take() {
            return Ok(Some(cell));
        }
        match self.merge.next() {
            Some(Ok(cell)) => Ok(Some(cell)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// The next row with at least one visible cell, or None at the end of
    /// the region range.
    pub fn next_row(&mut self) -> Result<Option<(Vec<u8>, RowResult)>> {
        if self.done {
            return Ok(None);
        }
        'rows: loop {
            let Some((key, value)) = self.next_cell()? else {
                self.done = true;
                return Ok(None);
            };
            if !self.end_key.is_empty() && key.row.as_slice() >= self.end_key.as_slice() {
                self.done = true;
                return Ok(None);
            }

            let row = key.row.clone();
            let skip = self
                .filter
                .as_ref()
                .is_some_and(|f| f.filter_row(&row));

            let mut columns: RowResult = BTreeMap::new();
            let mut deleted: HashSet<Vec<u8>> = HashSet::new();
            let mut cell = Some((key, value));
            while let Some((key, value)) = cell {
                if key.row != row {
                    self.peeked = Some((key, value));
                    break;
                }
                if !skip
                    && key.timestamp <= self.timestamp
                    && self.matcher.matches(&key.column)
                    && !columns.contains_key(&key.column)
                    && !deleted.contains(&key.column)
                {
                    match value {
                        CellValue::Delete => {
                            deleted.insert(key.column);
                        }
                        CellValue::Put(bytes) => {
                            columns.insert(key.column, bytes);
                        }
                    }
                }
                cell = self.next_cell()?;
            }

            if columns.is_empty() {
                continue 'rows;
            }
            return Ok(Some((row, columns)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FamilyDescriptor;
    use crate::key::LATEST_TIMESTAMP;
    use crate::tmpfs::TempDir;

    fn seeded_store(dir: &TempDir) -> Store {
        let store = Store::open(
            dir.path(),
            "t",
            1,
            FamilyDescriptor::new("f"),
            "t,,1".to_string(),
        )
        .expect("open store");
        for (row, ts, value) in [
            (b"a".as_slice(), 1u64, b"a1".as_slice()),
            (b"b", 1, b"b1"),
            (b"b", 2, b"b2"),
            (b"c", 1, b"c1"),
        ] {
            store
                .apply(vec![(
                    CellKey::new(row.to_vec(), b"f:c".to_vec(), ts),
                    CellValue::Put(value.to_vec()),
                )])
                .expect("apply");
        }
        store
    }

    fn scan_all(store: &Store, start: &[u8], ts: u64) -> Vec<(Vec<u8>, RowResult)> {
        let mut scanner = RegionScanner::new(
            &[store],
            ColumnMatcher::all(),
            start.to_vec(),
            ts,
            None,
            Vec::new(),
        )
        .expect("scanner");
        let mut rows = Vec::new();
        while let Some(row) = scanner.next_row().expect("next_row") {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_scan_newest_version_per_column() {
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir);

        let rows = scan_all(&store, b"", LATEST_TIMESTAMP);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, b"a");
        assert_eq!(rows[1].1.get(b"f:c".as_slice()).unwrap(), b"b2");
    }

    #[test]
    fn test_scan_respects_timestamp_bound() {
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir);

        let rows = scan_all(&store, b"", 1);
        assert_eq!(rows[1].1.get(b"f:c".as_slice()).unwrap(), b"b1");
    }

    #[test]
    fn test_scan_start_row_and_tombstones() {
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir);
        store
            .apply(vec![(
                CellKey::new(b"c".to_vec(), b"f:c".to_vec(), 5),
                CellValue::Delete,
            )])
            .expect("apply");

        let rows = scan_all(&store, b"b", LATEST_TIMESTAMP);
        // Row c is fully shadowed; only b remains from start row b.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, b"b");
    }

    #[test]
    fn test_scan_merges_memcache_and_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir);
        store.flush(1).expect("flush");
        store
            .apply(vec![(
                CellKey::new(b"b".to_vec(), b"f:c".to_vec(), 3),
                CellValue::Put(b"b3".to_vec()),
            )])
            .expect("apply");

        let rows = scan_all(&store, b"", LATEST_TIMESTAMP);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].1.get(b"f:c".as_slice()).unwrap(), b"b3");
    }

    #[test]
    fn test_row_filter_skips_rows() {
        struct SkipB;
        impl RowFilter for SkipB {
            fn filter_row(&self, row: &[u8]) -> bool {
                row == b"b"
            }
        }

        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir);
        let mut scanner = RegionScanner::new(
            &[&store],
            ColumnMatcher::all(),
            Vec::new(),
            LATEST_TIMESTAMP,
            Some(Box::new(SkipB)),
            Vec::new(),
        )
        .expect("scanner");

        let mut rows = Vec::new();
        while let Some((row, _)) = scanner.next_row().expect("next_row") {
            rows.push(row);
        }
        assert_eq!(rows, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_scan_stops_at_end_key() {
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir);
        let mut scanner = RegionScanner::new(
            &[&store],
            ColumnMatcher::all(),
            Vec::new(),
            LATEST_TIMESTAMP,
            None,
            b"c".to_vec(),
        )
        .expect("scanner");

        let mut rows = Vec::new();
        while let Some((row, _)) = scanner.next_row().expect("next_row") {
            rows.push(row);
        }
        assert_eq!(rows, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
