//! A store: all cells of one column family within one region.
//!
//! Physically a memcache plus an ordered list of immutable store files,
//! newest first. The store lock (an `RwLock` over the mutable parts)
//! serializes file-list swaps and commit application against readers, so a
//! reader sees either all of a commit or none of it.
//!
//! After a split, a child store starts out with *reference files*: small
//! markers pointing at the parent's files together with a bound (`Bottom` =
//! rows below the split key, `Top` = at or above). The first compaction
//! materializes the child's half and drops the references.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::catalog::FamilyDescriptor;
use crate::error::{Error, Result};
use crate::errinput;
use crate::key::{now_millis, CellKey, CellValue};
use crate::region::memcache::Memcache;
use crate::region::storefile::{StoreFileReader, StoreFileWriter};

/// Which half of the parent a reference file selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Half {
    /// Rows strictly below the split key.
    Bottom,
    /// Rows at or above the split key.
    Top,
}

/// On-disk payload of a `.ref` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ReferenceMeta {
    /// Parent store file path, relative to the server root directory.
    parent: String,
    split_row: Vec<u8>,
    half: Half,
}

/// One on-disk run, possibly narrowed to half of a parent file.
pub struct StoreFile {
    id: u64,
    reader: StoreFileReader,
    bound: Option<(Vec<u8>, Half)>,
    /// The file in this store's directory (`.sf` or `.ref`), deleted when
    /// compaction supersedes it.
    disk_path: PathBuf,
}

impl StoreFile {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_reference(&self) -> bool {
        self.bound.is_some()
    }

    pub fn flush_sequence(&self) -> u64 {
        self.reader.flush_sequence()
    }

    /// Approximate bytes owned by this file; a reference owns half its
    /// parent.
    pub fn size(&self) -> u64 {
        match self.bound {
            Some(_) => self.reader.size() / 2,
            None => self.reader.size(),
        }
    }

    fn includes_row(&self, row: &[u8]) -> bool {
        match &self.bound {
            Some((split, Half::Bottom)) => row < split.as_slice(),
            Some((split, Half::Top)) => row >= split.as_slice(),
            None => true,
        }
    }

    /// Owned cursor over this file's cells at or after `start`, respecting
    /// the reference bound.
    pub fn scan(
        &self,
        start: Option<&CellKey>,
    ) -> Result<Box<dyn Iterator<Item = Result<(CellKey, CellValue)>> + Send>> {
        let effective_start = match (&self.bound, start) {
            (Some((split, Half::Top)), Some(key)) if key.row < *split => {
                Some(CellKey::first_in_row(split.clone()))
            }
            (Some((split, Half::Top)), None) => Some(CellKey::first_in_row(split.clone())),
            (_, key) => key.cloned(),
        };
        let cursor = self.reader.scan(effective_start.as_ref())?;
        match self.bound.clone() {
            Some((split, half)) => Ok(Box::new(cursor.filter(move |item| match item {
                Ok((key, _)) => match half {
                    Half::Bottom => key.row < split,
                    Half::Top => key.row >= split,
                },
                Err(_) => true,
            }))),
            None => Ok(Box::new(cursor)),
        }
    }

    /// Versions of `(row, column)` at or below `timestamp`, newest first.
    fn versions(&self, row: &[u8], column: &[u8], timestamp: u64) -> Result<Vec<(u64, CellValue)>> {
        if !self.includes_row(row) {
            return Ok(Vec::new());
        }
        let start = CellKey::new(row.to_vec(), column.to_vec(), timestamp);
        let mut versions = Vec::new();
        for item in self.reader.scan(Some(&start))? {
            let (key, value) = item?;
            if !key.same_cell(&start) {
                break;
            }
            versions.push((key.timestamp, value));
        }
        Ok(versions)
    }
}

struct StoreInner {
    memcache: Arc<Memcache>,
    /// Frozen memcache being flushed; still readable until promoted.
    snapshot: Option<Arc<Memcache>>,
    /// Newest first.
    files: Vec<Arc<StoreFile>>,
}

pub struct Store {
    family: FamilyDescriptor,
    region_name: String,
    root_dir: PathBuf,
    /// `<table>/<region_id>/<family>`, relative to the root.
    rel: PathBuf,
    inner: RwLock<StoreInner>,
    next_file_id: AtomicU64,
}

impl Store {
    /// Opens the store, loading any existing store and reference files.
    pub fn open(
        root_dir: &Path,
        table: &str,
        region_id: u64,
        family: FamilyDescriptor,
        region_name: String,
    ) -> Result<Self> {
        let rel = PathBuf::from(table)
            .join(region_id.to_string())
            .join(&family.name);
        let dir = root_dir.join(&rel);
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        let mut max_id = 0u64;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((stem, ext)) = name.rsplit_once('.') else {
                continue;
            };
            let Ok(id) = stem.parse::<u64>() else {
                continue;
            };
            let file = match ext {
                "sf" => StoreFile {
                    id,
                    reader: StoreFileReader::open(&path)?,
                    bound: None,
                    disk_path: path.clone(),
                },
                "ref" => {
                    let meta: ReferenceMeta = bincode::deserialize(&fs::read(&path)?)?;
                    StoreFile {
                        id,
                        reader: StoreFileReader::open(&root_dir.join(&meta.parent))?,
                        bound: Some((meta.split_row, meta.half)),
                        disk_path: path.clone(),
                    }
                }
                _ => continue,
            };
            max_id = max_id.max(id);
            files.push(Arc::new(file));
        }
        // Newest first.
        files.sort_by(|a, b| b.id.cmp(&a.id));

        Ok(Self {
            family,
            region_name,
            root_dir: root_dir.to_path_buf(),
            rel,
            inner: RwLock::new(StoreInner {
                memcache: Arc::new(Memcache::new()),
                snapshot: None,
                files,
            }),
            next_file_id: AtomicU64::new(max_id + 1),
        })
    }

    pub fn family(&self) -> &FamilyDescriptor {
        &self.family
    }

    fn dir(&self) -> PathBuf {
        self.root_dir.join(&self.rel)
    }

    /// Applies one commit's edits for this store under the write lock, so
    /// concurrent readers never see a partial commit.
    pub fn apply(&self, cells: Vec<(CellKey, CellValue)>) -> Result<()> {
        let inner = self.inner.write()?;
        for (key, value) in cells {
            inner.memcache.apply(key, value);
        }
        Ok(())
    }

    pub fn memcache_size(&self) -> usize {
        self.inner
            .read()
            .map(|inner| {
                inner.memcache.size()
                    + inner.snapshot.as_ref().map_or(0, |s| s.size())
            })
            .unwrap_or(0)
    }

    /// Total bytes across the store's files.
    pub fn size(&self) -> u64 {
        self.inner
            .read()
            .map(|inner| inner.files.iter().map(|f| f.size()).sum())
            .unwrap_or(0)
    }

    pub fn file_count(&self) -> usize {
        self.inner.read().map(|inner| inner.files.len()).unwrap_or(0)
    }

    pub fn has_references(&self) -> bool {
        self.inner
            .read()
            .map(|inner| inner.files.iter().any(|f| f.is_reference()))
            .unwrap_or(false)
    }

    /// Highest WAL sequence already durable in this store's files.
    pub fn max_flush_sequence(&self) -> u64 {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .files
                    .iter()
                    .map(|f| f.flush_sequence())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// The middle row of the largest file, the split point candidate.
    pub fn mid_row(&self) -> Option<Vec<u8>> {
        let inner = self.inner.read().ok()?;
        inner
            .files
            .iter()
            .max_by_key(|f| f.size())
            .and_then(|f| f.reader.mid_row())
    }

    /// Snapshot of the read sources: memcaches newest first, then files
    /// newest first. Taken under the read lock and released before I/O.
    pub fn read_sources(&self) -> Result<(Vec<Arc<Memcache>>, Vec<Arc<StoreFile>>)> {
        let inner = self.inner.read()?;
        let mut memcaches = vec![inner.memcache.clone()];
        if let Some(snapshot) = &inner.snapshot {
            memcaches.push(snapshot.clone());
        }
        Ok((memcaches, inner.files.clone()))
    }

    /// Up to `versions` values of `(row, column)` at or below `timestamp`,
    /// newest first. A tombstone stops the walk: everything older is
    /// shadowed.
    pub fn get(
        &self,
        row: &[u8],
        column: &[u8],
        timestamp: u64,
        versions: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let (memcaches, files) = self.read_sources()?;

        // Gather (timestamp, value) per source, newest source first; merge
        // keeping the first occurrence of each timestamp.
        let mut merged: Vec<(u64, CellValue)> = Vec::new();
        let mut add = |candidates: Vec<(u64, CellValue)>| {
            for (ts, value) in candidates {
                match merged.binary_search_by(|(t, _)| ts.cmp(t)) {
                    Ok(_) => {} // an earlier (newer) source already wrote this version
                    Err(idx) => merged.insert(idx, (ts, value)),
                }
            }
        };
        for memcache in &memcaches {
            add(memcache.versions(row, column, timestamp));
        }
        for file in &files {
            add(file.versions(row, column, timestamp)?);
        }

        let mut values = Vec::new();
        for (_, value) in merged {
            match value {
                CellValue::Delete => break,
                CellValue::Put(bytes) => {
                    values.push(bytes);
                    if values.len() >= versions {
                        break;
                    }
                }
            }
        }
        Ok(values)
    }

    /// Swaps the memcache for an empty one, parking the old contents as a
    /// snapshot that stays readable until promoted. Returns false when
    /// there is nothing to flush. The region calls this for all its stores
    /// while holding its update gate, so no commit straddles the swap.
    ///
    /// A snapshot left over from a failed flush is retried as-is.
    pub fn take_snapshot(&self) -> Result<bool> {
        let mut inner = self.inner.write()?;
        if inner.snapshot.is_some() {
            return Ok(true);
        }
        if inner.memcache.is_empty() {
            return Ok(false);
        }
        let snapshot = std::mem::replace(&mut inner.memcache, Arc::new(Memcache::new()));
        inner.snapshot = Some(snapshot);
        Ok(true)
    }

    /// Writes the parked snapshot to a new store file covering WAL entries
    /// up to `flush_sequence` and promotes it into the file list.
    ///
    /// A failure here is a `DroppedSnapshot`: the edits exist only in the
    /// WAL and the server must restart to replay.
    pub fn promote_snapshot(&self, flush_sequence: u64) -> Result<()> {
        let Some(snapshot) = self.inner.read()?.snapshot.clone() else {
            return Ok(());
        };
        match self.write_snapshot(&snapshot, flush_sequence) {
            Ok(file) => {
                let mut inner = self.inner.write()?;
                inner.files.insert(0, Arc::new(file));
                inner.snapshot = None;
                Ok(())
            }
            Err(e) => Err(Error::DroppedSnapshot(format!(
                "{} {}: {e}",
                self.region_name, self.family.name
            ))),
        }
    }

    /// Single-store flush: snapshot then promote.
    pub fn flush(&self, flush_sequence: u64) -> Result<bool> {
        if !self.take_snapshot()? {
            return Ok(false);
        }
        self.promote_snapshot(flush_sequence)?;
        Ok(true)
    }

    /// Timestamp of the newest version of `(row, column)`, if any.
    pub fn newest_timestamp(&self, row: &[u8], column: &[u8]) -> Result<Option<u64>> {
        let (memcaches, files) = self.read_sources()?;
        let mut newest: Option<u64> = None;
        for memcache in &memcaches {
            if let Some((ts, _)) = memcache.versions(row, column, u64::MAX).first() {
                newest = Some(newest.map_or(*ts, |n: u64| n.max(*ts)));
            }
        }
        for file in &files {
            if let Some((ts, _)) = file.versions(row, column, u64::MAX)?.first() {
                newest = Some(newest.map_or(*ts, |n: u64| n.max(*ts)));
            }
        }
        Ok(newest)
    }

    /// Writes the union of two stores' files into a third store's
    /// directory as a single run. Both source regions must be closed, so
    /// their memcaches are empty. Grounded in the merge procedure: the
    /// merged region starts with one file per family.
    pub fn merge_stores(
        a: &Store,
        b: &Store,
        root_dir: &Path,
        table: &str,
        region_id: u64,
    ) -> Result<()> {
        let rel = PathBuf::from(table)
            .join(region_id.to_string())
            .join(&a.family.name);
        let dir = root_dir.join(&rel);
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        for store in [a, b] {
            let (_, store_files) = store.read_sources()?;
            files.extend(store_files);
        }
        // Newest first so ties resolve to the newer file.
        files.sort_by(|x, y| y.flush_sequence().cmp(&x.flush_sequence()));
        let flush_sequence = files.iter().map(|f| f.flush_sequence()).max().unwrap_or(0);

        let path = dir.join(format!("{:08}.sf", 1));
        let mut writer = StoreFileWriter::create(&path, flush_sequence)?;
        let sources: Vec<_> = files
            .iter()
            .map(|f| f.scan(None))
            .collect::<Result<Vec<_>>>()?;
        let mut merge = MergeCursor::new(sources);
        let mut policy = RetentionPolicy::new(&a.family);
        while let Some(item) = merge.next() {
            let (key, value) = item?;
            if policy.retain(&key, &value) {
                writer.add(&key, &value)?;
            }
        }
        writer.finish()?;
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &Memcache, flush_sequence: u64) -> Result<StoreFile> {
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir().join(format!("{id:08}.sf"));
        let mut writer = StoreFileWriter::create(&path, flush_sequence)?;
        for (key, value) in snapshot.entries() {
            writer.add(&key, &value)?;
        }
        let entries = writer.finish()?;
        tracing::info!(
            region = %self.region_name,
            family = %self.family.name,
            file = id,
            entries,
            flush_sequence,
            "flushed memcache to store file"
        );
        Ok(StoreFile {
            id,
            reader: StoreFileReader::open(&path)?,
            bound: None,
            disk_path: path,
        })
    }

    /// True when this store would benefit from a compaction: too many
    /// files, or references left over from a split.
    pub fn needs_compaction(&self, threshold: usize) -> bool {
        let Ok(inner) = self.inner.read() else {
            return false;
        };
        inner.files.len() >= threshold.max(2)
            || inner.files.iter().any(|f| f.is_reference())
    }

    /// Merges all files into one, applying the family's version and TTL
    /// retention policy and materializing any reference files. Idempotent;
    /// interruptible before the final swap.
    pub fn compact(&self) -> Result<()> {
        let files = {
            let inner = self.inner.read()?;
            if inner.files.len() < 2 && !inner.files.iter().any(|f| f.is_reference()) {
                return Ok(());
            }
            inner.files.clone()
        };

        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir().join(format!("{id:08}.sf"));
        let flush_sequence = files.iter().map(|f| f.flush_sequence()).max().unwrap_or(0);

        let mut writer = StoreFileWriter::create(&path, flush_sequence)?;
        let sources: Vec<_> = files
            .iter()
            .map(|f| f.scan(None))
            .collect::<Result<Vec<_>>>()?;
        let mut merge = MergeCursor::new(sources);

        let mut policy = RetentionPolicy::new(&self.family);
        let mut written = 0u64;
        while let Some(item) = merge.next() {
            let (key, value) = item?;
            if policy.retain(&key, &value) {
                writer.add(&key, &value)?;
                written += 1;
            }
        }
        writer.finish()?;
        let compacted = StoreFile {
            id,
            reader: StoreFileReader::open(&path)?,
            bound: None,
            disk_path: path,
        };

        // Swap the file list, then delete the inputs.
        let old_ids: Vec<u64> = files.iter().map(|f| f.id).collect();
        {
            let mut inner = self.inner.write()?;
            inner.files.retain(|f| !old_ids.contains(&f.id));
            inner.files.push(Arc::new(compacted));
            inner.files.sort_by(|a, b| b.id.cmp(&a.id));
        }
        for file in &files {
            if let Err(e) = fs::remove_file(&file.disk_path) {
                tracing::warn!(
                    path = %file.disk_path.display(),
                    error = %e,
                    "failed to delete compacted input"
                );
            }
        }

        tracing::info!(
            region = %self.region_name,
            family = %self.family.name,
            inputs = old_ids.len(),
            output = id,
            cells = written,
            "compacted store"
        );
        Ok(())
    }

    /// Writes reference files for one half of this store into a child
    /// store's directory. The store must hold no references itself.
    pub fn write_references(
        &self,
        child_table: &str,
        child_region_id: u64,
        split_row: &[u8],
        half: Half,
    ) -> Result<()> {
        let child_rel = PathBuf::from(child_table)
            .join(child_region_id.to_string())
            .join(&self.family.name);
        let child_dir = self.root_dir.join(&child_rel);
        fs::create_dir_all(&child_dir)?;

        let inner = self.inner.read()?;
        for file in &inner.files {
            if file.is_reference() {
                return errinput!(
                    "store {}/{} still holds references and cannot split",
                    self.region_name,
                    self.family.name
                );
            }
            let meta = ReferenceMeta {
                parent: self
                    .rel
                    .join(format!("{:08}.sf", file.id))
                    .to_string_lossy()
                    .into_owned(),
                split_row: split_row.to_vec(),
                half,
            };
            let path = child_dir.join(format!("{:08}.ref", file.id));
            fs::write(&path, bincode::serialize(&meta)?)?;
        }
        Ok(())
    }
}

/// K-way merge over sorted cell sources. Earlier sources win ties, so pass
/// newer sources first.
pub struct MergeCursor {
    sources: Vec<Box<dyn Iterator<Item = Result<(CellKey, CellValue)>> + Send>>,
    heap: BinaryHeap<Reverse<HeapCell>>,
    last: Option<CellKey>,
}

struct HeapCell {
    key: CellKey,
    value: CellValue,
    source: usize,
}

impl PartialEq for HeapCell {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}
impl Eq for HeapCell {}
impl PartialOrd for HeapCell {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapCell {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl MergeCursor {
    pub fn new(
        mut sources: Vec<Box<dyn Iterator<Item = Result<(CellKey, CellValue)>> + Send>>,
    ) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok((key, value))) => heap.push(Reverse(HeapCell { key, value, source })),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "store cursor failed while priming merge")
                }
                None => {}
            }
        }
        Self {
            sources,
            heap,
            last: None,
        }
    }
}

impl Iterator for MergeCursor {
    type Item = Result<(CellKey, CellValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Reverse(cell) = self.heap.pop()?;
            if let Some(item) = self.sources[cell.source].next() {
                match item {
                    Ok((key, value)) => self.heap.push(Reverse(HeapCell {
                        key,
                        value,
                        source: cell.source,
                    })),
                    Err(e) => return Some(Err(e)),
                }
            }
            // Exact duplicate (same row, column, timestamp) from an older
            // source: the newer source already produced it.
            if self.last.as_ref() == Some(&cell.key) {
                continue;
            }
            self.last = Some(cell.key.clone());
            return Some(Ok((cell.key, cell.value)));
        }
    }
}

/// Compaction retention: drops tombstone-shadowed cells, expired
/// tombstones, and versions beyond the family maximum.
struct RetentionPolicy {
    max_versions: u32,
    ttl_millis: Option<u64>,
    now: u64,
    current: Option<(Vec<u8>, Vec<u8>)>,
    puts_kept: u32,
    shadow: Option<u64>,
}

impl RetentionPolicy {
    fn new(family: &FamilyDescriptor) -> Self {
        Self {
            max_versions: family.max_versions,
            ttl_millis: family.ttl_millis,
            now: now_millis(),
            current: None,
            puts_kept: 0,
            shadow: None,
        }
    }

    fn retain(&mut self, key: &CellKey, value: &CellValue) -> bool {
        let cell = (key.row.clone(), key.column.clone());
        if self.current.as_ref() != Some(&cell) {
            self.current = Some(cell);
            self.puts_kept = 0;
            self.shadow = None;
        }

        if let Some(shadow) = self.shadow {
            if key.timestamp <= shadow {
                return false;
            }
        }

        match value {
            CellValue::Delete => {
                self.shadow = Some(key.timestamp);
                let expired = self
                    .ttl_millis
                    .is_some_and(|ttl| self.now.saturating_sub(key.timestamp) > ttl);
                !expired
            }
            CellValue::Put(_) => {
                if self.puts_kept >= self.max_versions {
                    return false;
                }
                self.puts_kept += 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(
            dir.path(),
            "t",
            1,
            FamilyDescriptor::new("f").max_versions(2),
            "t,,1".to_string(),
        )
        .expect("open store")
    }

    fn put(store: &Store, row: &[u8], ts: u64, value: &[u8]) {
        store
            .apply(vec![(
                CellKey::new(row.to_vec(), b"f:c".to_vec(), ts),
                CellValue::Put(value.to_vec()),
            )])
            .expect("apply");
    }

    #[test]
    fn test_get_merges_memcache_and_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);

        put(&store, b"k1", 1, b"a");
        assert!(store.flush(1).expect("flush"));
        put(&store, b"k1", 2, b"b");

        let values = store.get(b"k1", b"f:c", 2, 5).expect("get");
        assert_eq!(values, vec![b"b".to_vec(), b"a".to_vec()]);

        // Upper bound hides the newer memcache version.
        let values = store.get(b"k1", b"f:c", 1, 5).expect("get");
        assert_eq!(values, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_tombstone_shadows_older_values() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);

        put(&store, b"k1", 10, b"v");
        store
            .apply(vec![(
                CellKey::new(b"k1".to_vec(), b"f:c".to_vec(), 10),
                CellValue::Delete,
            )])
            .expect("apply delete");

        let values = store.get(b"k1", b"f:c", 10, 1).expect("get");
        assert!(values.is_empty());
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        assert!(!store.flush(1).expect("flush"));
        assert_eq!(store.file_count(), 0);
    }

    #[test]
    fn test_compaction_merges_and_applies_versions() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);

        // Three flushes -> three files, four versions of one cell.
        for (ts, val) in [(1u64, b"a"), (2, b"b"), (3, b"c"), (4, b"d")] {
            put(&store, b"k1", ts, val);
            assert!(store.flush(ts).expect("flush"));
        }
        assert_eq!(store.file_count(), 4);
        assert!(store.needs_compaction(3));

        store.compact().expect("compact");
        assert_eq!(store.file_count(), 1);

        // max_versions = 2: only the two newest survive.
        let values = store.get(b"k1", b"f:c", u64::MAX, 10).expect("get");
        assert_eq!(values, vec![b"d".to_vec(), b"c".to_vec()]);
        assert_eq!(store.max_flush_sequence(), 4);
    }

    #[test]
    fn test_compaction_drops_shadowed_cells() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);

        put(&store, b"k1", 5, b"old");
        store.flush(5).expect("flush");
        store
            .apply(vec![(
                CellKey::new(b"k1".to_vec(), b"f:c".to_vec(), 6),
                CellValue::Delete,
            )])
            .expect("apply");
        store.flush(6).expect("flush");

        store.compact().expect("compact");
        let values = store.get(b"k1", b"f:c", u64::MAX, 10).expect("get");
        assert!(values.is_empty(), "tombstone still shadows after compaction");
    }

    #[test]
    fn test_references_split_and_materialize() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);

        for row in [b"a".as_slice(), b"b", b"m", b"x"] {
            put(&store, row, 1, b"v");
        }
        store.flush(1).expect("flush");

        store
            .write_references("t", 2, b"m", Half::Bottom)
            .expect("bottom refs");
        store
            .write_references("t", 3, b"m", Half::Top)
            .expect("top refs");

        let bottom = Store::open(
            dir.path(),
            "t",
            2,
            FamilyDescriptor::new("f"),
            "t,,2".to_string(),
        )
        .expect("open bottom");
        assert!(bottom.has_references());
        assert_eq!(bottom.get(b"a", b"f:c", u64::MAX, 1).expect("get"), vec![b"v".to_vec()]);
        assert!(bottom.get(b"m", b"f:c", u64::MAX, 1).expect("get").is_empty());

        let top = Store::open(
            dir.path(),
            "t",
            3,
            FamilyDescriptor::new("f"),
            "t,,3".to_string(),
        )
        .expect("open top");
        assert_eq!(top.get(b"m", b"f:c", u64::MAX, 1).expect("get"), vec![b"v".to_vec()]);
        assert!(top.get(b"b", b"f:c", u64::MAX, 1).expect("get").is_empty());

        // Materialize the top half; references disappear, data stays.
        top.compact().expect("compact");
        assert!(!top.has_references());
        assert_eq!(top.get(b"x", b"f:c", u64::MAX, 1).expect("get"), vec![b"v".to_vec()]);
        assert!(top.get(b"a", b"f:c", u64::MAX, 1).expect("get").is_empty());
    }
}
