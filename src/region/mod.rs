//! Regions: contiguous row-key ranges of one table, the unit of assignment.
//!
//! A region owns one store per column family. Writes go through a per-row
//! lock: `start_update` claims the row, buffered `put`/`delete` edits are
//! applied by `commit`, which appends them to the shared write-ahead log as
//! one record before touching any memcache. Reads merge the memcaches and
//! store files of the stores involved.
//!
//! ```text
//!            start_update(row) ─► lock id
//!                   │ put/delete (buffered)
//!                   ▼
//!  commit ─► WAL append (seq S) ─► memcache apply ─► unlock
//! ```
//!
//! State machine: `Opening → Open → {Splitting, Closing} → Closed`. Writes
//! are accepted only in `Open`; reads also in `Splitting` and `Closing`
//! (a retiring region answers reads until evicted).

pub mod memcache;
pub mod scanner;
pub mod store;
pub mod storefile;

pub use scanner::{RegionScanner, RowFilter, RowResult};
pub use store::{Half, Store};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::catalog::RegionInfo;
use crate::error::{Error, Result};
use crate::errinput;
use crate::key::{self, CellKey, CellValue, ColumnMatcher, LATEST_TIMESTAMP};
use crate::wal::{Hlog, LogEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Opening,
    Open,
    Splitting,
    Closing,
    Closed,
}

/// Notified around a region becoming unavailable, so the enclosing
/// registry can move it to retiring and finally evict it.
pub trait RegionUnavailableListener: Send + Sync {
    fn closing(&self, region_name: &str);
    fn closed(&self, region_name: &str);
}

struct PendingUpdate {
    row: Vec<u8>,
    edits: Vec<(Vec<u8>, CellValue)>,
}

#[derive(Default)]
struct RowLocks {
    by_row: HashMap<Vec<u8>, u64>,
    pending: HashMap<u64, PendingUpdate>,
}

pub struct Region {
    info: RwLock<RegionInfo>,
    name: String,
    name_bytes: Vec<u8>,
    root_dir: PathBuf,
    log: Arc<Hlog>,
    stores: BTreeMap<String, Arc<Store>>,
    state: RwLock<RegionState>,
    /// Commits hold this shared; a flush holds it exclusively while it
    /// snapshots, so no commit straddles the snapshot point.
    update_gate: RwLock<()>,
    locks: Mutex<RowLocks>,
    lock_released: Condvar,
    next_lock_id: AtomicU64,
    last_flush: Mutex<Instant>,
}

impl Region {
    /// Opens a region: loads its stores and replays the WAL tail past the
    /// region's minimum flushed sequence id. `replay_from` points at a
    /// previous incarnation's log directory; when absent the server's own
    /// log is replayed (a no-op for freshly created regions).
    pub fn open(
        root_dir: &Path,
        info: RegionInfo,
        log: Arc<Hlog>,
        replay_from: Option<&Path>,
    ) -> Result<Self> {
        let name = info.region_name();
        let name_bytes = name.clone().into_bytes();
        let state = RwLock::new(RegionState::Opening);

        let mut stores = BTreeMap::new();
        for family in &info.families {
            let store = Store::open(
                root_dir,
                &info.table,
                info.region_id,
                family.clone(),
                name.clone(),
            )?;
            stores.insert(family.name.clone(), Arc::new(store));
        }

        let min_flushed = stores
            .values()
            .map(|s| s.max_flush_sequence())
            .min()
            .unwrap_or(0);
        let entries = match replay_from {
            Some(dir) => Hlog::replay_dir(dir, &name_bytes, min_flushed)?,
            None => log.replay(&name_bytes, min_flushed)?,
        };
        let replayed = entries.len();

        let mut max_seq = stores
            .values()
            .map(|s| s.max_flush_sequence())
            .max()
            .unwrap_or(0);
        let mut per_store: BTreeMap<String, Vec<(CellKey, CellValue)>> = BTreeMap::new();
        for entry in entries {
            max_seq = max_seq.max(entry.sequence);
            let family = String::from_utf8_lossy(key::family(&entry.key.column)?).into_owned();
            per_store
                .entry(family)
                .or_default()
                .push((entry.key, entry.value));
        }
        for (family, cells) in per_store {
            match stores.get(&family) {
                Some(store) => store.apply(cells)?,
                None => {
                    tracing::warn!(
                        region = %name,
                        family = %family,
                        "dropping replayed edits for unknown family"
                    );
                }
            }
        }
        log.raise_sequence(max_seq);

        let region = Self {
            info: RwLock::new(info),
            name,
            name_bytes,
            root_dir: root_dir.to_path_buf(),
            log,
            stores,
            state,
            update_gate: RwLock::new(()),
            locks: Mutex::new(RowLocks::default()),
            lock_released: Condvar::new(),
            next_lock_id: AtomicU64::new(1),
            last_flush: Mutex::new(Instant::now()),
        };
        region.persist_info()?;
        *region.state.write()? = RegionState::Open;
        tracing::info!(region = %region.name, replayed, "opened region");
        Ok(region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.name_bytes
    }

    pub fn info(&self) -> Result<RegionInfo> {
        Ok(self.info.read()?.clone())
    }

    pub fn state(&self) -> RegionState {
        self.state.read().map(|s| *s).unwrap_or(RegionState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RegionState::Closed
    }

    pub fn store(&self, family: &str) -> Option<&Arc<Store>> {
        self.stores.get(family)
    }

    /// Total memcache bytes across stores, snapshots included.
    pub fn memcache_size(&self) -> usize {
        self.stores.values().map(|s| s.memcache_size()).sum()
    }

    /// Size of the largest store, the split trigger metric.
    pub fn largest_store_size(&self) -> u64 {
        self.stores.values().map(|s| s.size()).max().unwrap_or(0)
    }

    pub fn since_last_flush(&self) -> Duration {
        self.last_flush
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn check_read(&self) -> Result<()> {
        match self.state() {
            RegionState::Open | RegionState::Splitting | RegionState::Closing => Ok(()),
            _ => Err(Error::NotServingRegion(self.name.clone())),
        }
    }

    fn check_write(&self) -> Result<()> {
        match self.state() {
            RegionState::Open => Ok(()),
            _ => Err(Error::NotServingRegion(self.name.clone())),
        }
    }

    fn store_for_column(&self, column: &[u8]) -> Result<&Arc<Store>> {
        let family = key::family(column)?;
        let family = String::from_utf8_lossy(family);
        self.stores.get(family.as_ref()).ok_or_else(|| {
            Error::InvalidInput(format!("unknown column family {family} in {}", self.name))
        })
    }

    // Reads

    /// Up to `versions` values of `(row, column)` at or below `timestamp`,
    /// newest first.
    pub fn get(
        &self,
        row: &[u8],
        column: &[u8],
        timestamp: u64,
        versions: usize,
    ) -> Result<Vec<Vec<u8>>> {
        self.check_read()?;
        self.store_for_column(column)?
            .get(row, column, timestamp, versions.max(1))
    }

    /// The newest visible value per column of `row`.
    pub fn get_full(&self, row: &[u8]) -> Result<RowResult> {
        self.check_read()?;
        let mut scanner = self.scanner(
            ColumnMatcher::all(),
            row.to_vec(),
            LATEST_TIMESTAMP,
            None,
        )?;
        match scanner.next_row()? {
            Some((found, columns)) if found == row => Ok(columns),
            _ => Ok(RowResult::new()),
        }
    }

    /// A cursor over the region from `start_row`, bounded by the region's
    /// end key.
    pub fn scanner(
        &self,
        matcher: ColumnMatcher,
        start_row: Vec<u8>,
        timestamp: u64,
        filter: Option<Box<dyn RowFilter>>,
    ) -> Result<RegionScanner> {
        self.check_read()?;
        let end_key = self.info.read()?.end_key.clone();
        let stores: Vec<&Store> = match matcher.families() {
            Some(families) => families
                .iter()
                .filter_map(|f| {
                    self.stores
                        .get(String::from_utf8_lossy(f).as_ref())
                        .map(|s| s.as_ref())
                })
                .collect(),
            None => self.stores.values().map(|s| s.as_ref()).collect(),
        };
        RegionScanner::new(&stores, matcher, start_row, timestamp, filter, end_key)
    }

    // Writes

    /// Claims the row lock, blocking while another update holds it.
    /// Returns a server-local lock id scoping the buffered edits.
    pub fn start_update(&self, row: &[u8]) -> Result<u64> {
        self.check_write()?;
        if !self.info.read()?.contains_row(row) {
            return errinput!(
                "row {:?} is outside region {}",
                String::from_utf8_lossy(row),
                self.name
            );
        }
        let mut locks = self.locks.lock()?;
        while locks.by_row.contains_key(row) {
            locks = self.lock_released.wait(locks)?;
        }
        let lock_id = self.next_lock_id.fetch_add(1, Ordering::SeqCst);
        locks.by_row.insert(row.to_vec(), lock_id);
        locks.pending.insert(
            lock_id,
            PendingUpdate {
                row: row.to_vec(),
                edits: Vec::new(),
            },
        );
        Ok(lock_id)
    }

    pub fn put(&self, lock_id: u64, column: &[u8], value: Vec<u8>) -> Result<()> {
        self.store_for_column(column)?;
        self.buffer_edit(lock_id, column, CellValue::Put(value))
    }

    pub fn delete(&self, lock_id: u64, column: &[u8]) -> Result<()> {
        self.store_for_column(column)?;
        self.buffer_edit(lock_id, column, CellValue::Delete)
    }

    fn buffer_edit(&self, lock_id: u64, column: &[u8], value: CellValue) -> Result<()> {
        let mut locks = self.locks.lock()?;
        let pending = locks
            .pending
            .get_mut(&lock_id)
            .ok_or(Error::UnknownLock(lock_id))?;
        pending.edits.push((column.to_vec(), value));
        Ok(())
    }

    /// Appends the buffered edits to the WAL as one record, applies them to
    /// the memcaches, and releases the row lock. The lock is released even
    /// when the append fails; the caller decides whether the server aborts.
    pub fn commit(&self, lock_id: u64, timestamp: u64) -> Result<()> {
        let ts = if timestamp == LATEST_TIMESTAMP {
            key::now_millis()
        } else {
            timestamp
        };
        let (row, edits) = {
            let locks = self.locks.lock()?;
            let pending = locks
                .pending
                .get(&lock_id)
                .ok_or(Error::UnknownLock(lock_id))?;
            (pending.row.clone(), pending.edits.clone())
        };
        let result = self.apply_commit(&row, &edits, ts);
        self.release_lock(lock_id);
        result
    }

    fn apply_commit(&self, row: &[u8], edits: &[(Vec<u8>, CellValue)], ts: u64) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let _gate = self.update_gate.read()?;
        let sequence = self.log.next_sequence();
        let entries: Vec<LogEntry> = edits
            .iter()
            .map(|(column, value)| LogEntry {
                sequence,
                region: self.name_bytes.clone(),
                key: CellKey::new(row.to_vec(), column.clone(), ts),
                value: value.clone(),
            })
            .collect();
        self.log.append(&entries)?;

        let mut per_store: BTreeMap<String, Vec<(CellKey, CellValue)>> = BTreeMap::new();
        for entry in entries {
            let family = String::from_utf8_lossy(key::family(&entry.key.column)?).into_owned();
            per_store
                .entry(family)
                .or_default()
                .push((entry.key, entry.value));
        }
        for (family, cells) in per_store {
            // put/delete validated the family, so the store exists.
            if let Some(store) = self.stores.get(&family) {
                store.apply(cells)?;
            }
        }
        Ok(())
    }

    /// Discards the buffered edits and releases the row lock.
    pub fn abort(&self, lock_id: u64) -> Result<()> {
        let mut locks = self.locks.lock()?;
        let pending = locks
            .pending
            .remove(&lock_id)
            .ok_or(Error::UnknownLock(lock_id))?;
        locks.by_row.remove(&pending.row);
        drop(locks);
        self.lock_released.notify_all();
        Ok(())
    }

    fn release_lock(&self, lock_id: u64) {
        if let Ok(mut locks) = self.locks.lock() {
            if let Some(pending) = locks.pending.remove(&lock_id) {
                locks.by_row.remove(&pending.row);
            }
        }
        self.lock_released.notify_all();
    }

    /// Writes a tombstone for `(row, column)` at `timestamp`, shadowing
    /// every older version. A latest-timestamp delete lands on the newest
    /// existing cell's timestamp so it overshadows it.
    pub fn delete_all(&self, row: &[u8], column: &[u8], timestamp: u64) -> Result<()> {
        let ts = if timestamp == LATEST_TIMESTAMP {
            self.store_for_column(column)?
                .newest_timestamp(row, column)?
                .unwrap_or_else(key::now_millis)
        } else {
            timestamp
        };
        let lock_id = self.start_update(row)?;
        let result = self
            .delete(lock_id, column)
            .and_then(|_| self.commit(lock_id, ts));
        if result.is_err() {
            let _ = self.abort(lock_id);
        }
        result
    }

    // Maintenance

    /// Spills every store's memcache to disk and records the flush point
    /// with the WAL. Returns false when there was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        if self.state() == RegionState::Closed {
            return Ok(false);
        }
        // Exclude commits while choosing the flush point and snapshotting,
        // so the flushed files cover exactly the sequences they claim.
        let (flush_seq, any) = {
            let _gate = self.update_gate.write()?;
            let flush_seq = self.log.last_sequence();
            let mut any = false;
            for store in self.stores.values() {
                any |= store.take_snapshot()?;
            }
            (flush_seq, any)
        };
        if !any {
            return Ok(false);
        }
        for store in self.stores.values() {
            store.promote_snapshot(flush_seq)?;
        }
        self.log.flush_complete(&self.name_bytes, flush_seq);
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        Ok(true)
    }

    pub fn needs_compaction(&self, threshold: usize) -> bool {
        self.stores.values().any(|s| s.needs_compaction(threshold))
    }

    /// Compacts every store that needs it. Idempotent.
    pub fn compact(&self, threshold: usize) -> Result<()> {
        for store in self.stores.values() {
            if store.needs_compaction(threshold) {
                store.compact()?;
            }
        }
        Ok(())
    }

    /// The split point when this region has outgrown `max_filesize`: the
    /// middle row of the largest store. A region still holding reference
    /// files must compact before it can split again.
    pub fn needs_split(&self, max_filesize: u64) -> Option<Vec<u8>> {
        if self.stores.values().any(|s| s.has_references()) {
            return None;
        }
        let largest = self.stores.values().max_by_key(|s| s.size())?;
        if largest.size() <= max_filesize {
            return None;
        }
        let mid = largest.mid_row()?;
        let info = self.info.read().ok()?;
        let inside = (info.start_key.is_empty() || mid.as_slice() > info.start_key.as_slice())
            && (info.end_key.is_empty() || mid.as_slice() < info.end_key.as_slice());
        inside.then_some(mid)
    }

    /// Stops writers, flushes, and carves the region into two children
    /// whose stores reference the parent's files. The parent descriptor is
    /// marked `offline, split`; the children are not opened here, the
    /// master assigns them.
    pub fn close_and_split(
        &self,
        mid_key: &[u8],
        listener: &dyn RegionUnavailableListener,
    ) -> Result<(RegionInfo, RegionInfo)> {
        let info = self.info()?;
        {
            let mut state = self.state.write()?;
            if *state != RegionState::Open {
                return Err(Error::NotServingRegion(self.name.clone()));
            }
            *state = RegionState::Splitting;
        }
        self.wait_for_updates()?;
        self.flush()?;
        listener.closing(&self.name);

        let base_id = key::now_millis();
        let child_a = RegionInfo::new(
            info.table.clone(),
            info.start_key.clone(),
            mid_key.to_vec(),
            base_id,
            info.families.clone(),
        );
        let child_b = RegionInfo::new(
            info.table.clone(),
            mid_key.to_vec(),
            info.end_key.clone(),
            base_id + 1,
            info.families.clone(),
        );
        for store in self.stores.values() {
            store.write_references(&info.table, child_a.region_id, mid_key, Half::Bottom)?;
            store.write_references(&info.table, child_b.region_id, mid_key, Half::Top)?;
        }
        persist_region_info(&self.root_dir, &child_a)?;
        persist_region_info(&self.root_dir, &child_b)?;

        {
            let mut info = self.info.write()?;
            info.offline = true;
            info.split = true;
        }
        self.persist_info()?;
        *self.state.write()? = RegionState::Closed;
        listener.closed(&self.name);

        tracing::info!(
            parent = %self.name,
            child_a = %child_a.region_name(),
            child_b = %child_b.region_name(),
            "split region"
        );
        Ok((child_a, child_b))
    }

    /// Closes the region. Without `abort` the memcache is flushed first;
    /// with it, buffered edits are dropped and must be replayed from the
    /// WAL on the next open.
    pub fn close(&self, abort: bool) -> Result<()> {
        {
            let mut state = self.state.write()?;
            if *state == RegionState::Closed {
                return Ok(());
            }
            *state = RegionState::Closing;
        }
        self.wait_for_updates()?;
        if !abort {
            self.flush()?;
        }
        *self.state.write()? = RegionState::Closed;
        tracing::info!(region = %self.name, abort, "closed region");
        Ok(())
    }

    fn wait_for_updates(&self) -> Result<()> {
        let mut locks = self.locks.lock()?;
        while !locks.by_row.is_empty() {
            locks = self.lock_released.wait(locks)?;
        }
        Ok(())
    }

    /// Closes two adjacent regions and produces one covering the union of
    /// their ranges, with each family's files merged into a single run.
    pub fn close_and_merge(a: &Region, b: &Region) -> Result<RegionInfo> {
        let info_a = a.info()?;
        let info_b = b.info()?;
        if !info_a.adjacent_to(&info_b) {
            return errinput!(
                "regions {} and {} are not adjacent",
                a.name(),
                b.name()
            );
        }
        a.close(false)?;
        b.close(false)?;

        let merged = RegionInfo::new(
            info_a.table.clone(),
            info_a.start_key.clone(),
            info_b.end_key.clone(),
            key::now_millis(),
            info_a.families.clone(),
        );
        for (family, store_a) in &a.stores {
            let store_b = b.stores.get(family).ok_or_else(|| {
                Error::InvalidInput(format!("family {family} missing from {}", b.name()))
            })?;
            Store::merge_stores(store_a, store_b, &a.root_dir, &merged.table, merged.region_id)?;
        }
        persist_region_info(&a.root_dir, &merged)?;
        tracing::info!(
            a = %a.name(),
            b = %b.name(),
            merged = %merged.region_name(),
            "merged regions"
        );
        Ok(merged)
    }

    fn persist_info(&self) -> Result<()> {
        let info = self.info.read()?.clone();
        persist_region_info(&self.root_dir, &info)
    }
}

/// Writes a region descriptor under `<table>/<region_id>/info/regioninfo`.
pub fn persist_region_info(root_dir: &Path, info: &RegionInfo) -> Result<()> {
    let dir = root_dir
        .join(&info.table)
        .join(info.region_id.to_string())
        .join("info");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("regioninfo"), info.encode()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FamilyDescriptor;
    use crate::tmpfs::TempDir;

    fn test_info(start: &[u8], end: &[u8], id: u64) -> RegionInfo {
        RegionInfo::new(
            "t",
            start.to_vec(),
            end.to_vec(),
            id,
            vec![FamilyDescriptor::new("f").max_versions(5)],
        )
    }

    fn open_region(dir: &TempDir) -> (Region, Arc<Hlog>) {
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));
        let region =
            Region::open(dir.path(), test_info(b"a", b"z", 1), log.clone(), None).expect("open");
        (region, log)
    }

    fn commit_put(region: &Region, row: &[u8], column: &[u8], value: &[u8], ts: u64) {
        let lock = region.start_update(row).expect("start_update");
        region.put(lock, column, value.to_vec()).expect("put");
        region.commit(lock, ts).expect("commit");
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);

        commit_put(&region, b"k1", b"f:c", b"v1", 100);
        let values = region.get(b"k1", b"f:c", 100, 1).expect("get");
        assert_eq!(values, vec![b"v1".to_vec()]);
    }

    #[test]
    fn test_versioning() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);

        for (ts, value) in [(1u64, b"a"), (2, b"b"), (3, b"c")] {
            commit_put(&region, b"k1", b"f:c", value, ts);
        }

        let values = region.get(b"k1", b"f:c", 3, 2).expect("get");
        assert_eq!(values, vec![b"c".to_vec(), b"b".to_vec()]);
        let values = region.get(b"k1", b"f:c", 2, 5).expect("get");
        assert_eq!(values, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_delete_tombstones_older_values() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);

        commit_put(&region, b"k1", b"f:c", b"v", 10);
        region.delete_all(b"k1", b"f:c", 10).expect("delete_all");
        let values = region.get(b"k1", b"f:c", 10, 1).expect("get");
        assert!(values.is_empty());
    }

    #[test]
    fn test_latest_delete_lands_on_newest_cell() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);

        commit_put(&region, b"k1", b"f:c", b"v", 77);
        region
            .delete_all(b"k1", b"f:c", LATEST_TIMESTAMP)
            .expect("delete_all");
        assert!(region.get(b"k1", b"f:c", 77, 1).expect("get").is_empty());
    }

    #[test]
    fn test_row_lock_excludes_second_writer() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);
        let region = Arc::new(region);

        let lock = region.start_update(b"k1").expect("start_update");
        let contender = {
            let region = region.clone();
            std::thread::spawn(move || {
                let lock = region.start_update(b"k1").expect("start_update");
                region.put(lock, b"f:c", b"second".to_vec()).expect("put");
                region.commit(lock, 2).expect("commit");
            })
        };
        // The contender must block until our commit releases the row.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());

        region.put(lock, b"f:c", b"first".to_vec()).expect("put");
        region.commit(lock, 1).expect("commit");
        contender.join().expect("join");

        let values = region
            .get(b"k1", b"f:c", LATEST_TIMESTAMP, 2)
            .expect("get");
        assert_eq!(values, vec![b"second".to_vec(), b"first".to_vec()]);
    }

    #[test]
    fn test_abort_discards_edits() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);

        let lock = region.start_update(b"k1").expect("start_update");
        region.put(lock, b"f:c", b"v".to_vec()).expect("put");
        region.abort(lock).expect("abort");
        assert!(region
            .get(b"k1", b"f:c", LATEST_TIMESTAMP, 1)
            .expect("get")
            .is_empty());
        assert!(matches!(
            region.put(lock, b"f:c", b"v".to_vec()),
            Err(Error::UnknownLock(_))
        ));
    }

    #[test]
    fn test_flush_then_replay_is_noop() {
        let dir = TempDir::new().expect("temp dir");
        let (region, log) = open_region(&dir);

        commit_put(&region, b"k1", b"f:c", b"v1", 1);
        commit_put(&region, b"k2", b"f:c", b"v2", 2);
        assert!(region.flush().expect("flush"));

        let flush_seq = region.store("f").unwrap().max_flush_sequence();
        let tail = log.replay(region.name_bytes(), flush_seq).expect("replay");
        assert!(tail.is_empty(), "flushed edits must not replay");

        // Data still readable from the store file.
        let values = region.get(b"k1", b"f:c", LATEST_TIMESTAMP, 1).expect("get");
        assert_eq!(values, vec![b"v1".to_vec()]);
    }

    #[test]
    fn test_reopen_replays_unflushed_edits() {
        let dir = TempDir::new().expect("temp dir");
        let log_path = dir.path().join("log");
        {
            let log = Arc::new(Hlog::create(&log_path).expect("log"));
            let region =
                Region::open(dir.path(), test_info(b"a", b"z", 1), log, None).expect("open");
            commit_put(&region, b"k1", b"f:c", b"flushed", 1);
            region.flush().expect("flush");
            commit_put(&region, b"k2", b"f:c", b"unflushed", 2);
            region.close(true).expect("abort close");
            // Log files intentionally left behind, as on abort.
        }

        let log2 = Arc::new(Hlog::create(dir.path().join("log2")).expect("log2"));
        let region = Region::open(
            dir.path(),
            test_info(b"a", b"z", 1),
            log2,
            Some(log_path.as_path()),
        )
        .expect("reopen");
        let values = region.get(b"k2", b"f:c", LATEST_TIMESTAMP, 1).expect("get");
        assert_eq!(values, vec![b"unflushed".to_vec()]);
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }
    impl RegionUnavailableListener for RecordingListener {
        fn closing(&self, name: &str) {
            self.events.lock().unwrap().push(format!("closing {name}"));
        }
        fn closed(&self, name: &str) {
            self.events.lock().unwrap().push(format!("closed {name}"));
        }
    }

    #[test]
    fn test_split_preserves_visible_cells() {
        let dir = TempDir::new().expect("temp dir");
        let (region, log) = open_region(&dir);

        let mut expected = Vec::new();
        for byte in b'a'..=b'y' {
            let row = vec![byte];
            commit_put(&region, &row, b"f:c", &row, 1);
            expected.push(row);
        }

        let listener = RecordingListener::default();
        let (child_a, child_b) = region.close_and_split(b"m", &listener).expect("split");

        assert_eq!(child_a.start_key, b"a");
        assert_eq!(child_a.end_key, b"m");
        assert_eq!(child_b.start_key, b"m");
        assert_eq!(child_b.end_key, b"z");

        let parent_info = region.info().expect("info");
        assert!(parent_info.offline && parent_info.split);
        let events = listener.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("closing"));
        assert!(events[1].starts_with("closed"));

        // Children together serve exactly the parent's cells.
        let mut rows = Vec::new();
        for info in [child_a, child_b] {
            let child = Region::open(dir.path(), info, log.clone(), None).expect("open child");
            let mut scanner = child
                .scanner(ColumnMatcher::all(), Vec::new(), LATEST_TIMESTAMP, None)
                .expect("scanner");
            while let Some((row, columns)) = scanner.next_row().expect("next_row") {
                assert_eq!(columns.get(b"f:c".as_slice()).unwrap(), &row);
                rows.push(row);
            }
        }
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_split_children_compact_to_materialize() {
        let dir = TempDir::new().expect("temp dir");
        let (region, log) = open_region(&dir);

        for byte in b'a'..=b'y' {
            commit_put(&region, &[byte], b"f:c", &[byte], 1);
        }
        let listener = RecordingListener::default();
        let (child_a, _child_b) = region.close_and_split(b"m", &listener).expect("split");

        let child = Region::open(dir.path(), child_a, log, None).expect("open child");
        assert!(child.needs_compaction(100), "references force compaction");
        child.compact(100).expect("compact");
        assert!(!child.store("f").unwrap().has_references());
        let values = child.get(b"b", b"f:c", LATEST_TIMESTAMP, 1).expect("get");
        assert_eq!(values, vec![b"b".to_vec()]);
    }

    #[test]
    fn test_close_rejects_new_writes() {
        let dir = TempDir::new().expect("temp dir");
        let (region, _log) = open_region(&dir);
        commit_put(&region, b"k1", b"f:c", b"v", 1);
        region.close(false).expect("close");

        assert!(matches!(
            region.start_update(b"k1"),
            Err(Error::NotServingRegion(_))
        ));
        assert!(matches!(
            region.get(b"k1", b"f:c", 1, 1),
            Err(Error::NotServingRegion(_))
        ));
    }

    #[test]
    fn test_merge_adjacent_regions() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));
        let a = Region::open(dir.path(), test_info(b"a", b"m", 1), log.clone(), None)
            .expect("open a");
        let b = Region::open(dir.path(), test_info(b"m", b"z", 2), log.clone(), None)
            .expect("open b");

        commit_put(&a, b"b", b"f:c", b"left", 1);
        commit_put(&b, b"n", b"f:c", b"right", 1);

        let merged_info = Region::close_and_merge(&a, &b).expect("merge");
        assert_eq!(merged_info.start_key, b"a");
        assert_eq!(merged_info.end_key, b"z");

        let merged = Region::open(dir.path(), merged_info, log, None).expect("open merged");
        assert_eq!(
            merged.get(b"b", b"f:c", LATEST_TIMESTAMP, 1).expect("get"),
            vec![b"left".to_vec()]
        );
        assert_eq!(
            merged.get(b"n", b"f:c", LATEST_TIMESTAMP, 1).expect("get"),
            vec![b"right".to_vec()]
        );
    }

    #[test]
    fn test_merge_rejects_non_adjacent() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));
        let a = Region::open(dir.path(), test_info(b"a", b"f", 1), log.clone(), None)
            .expect("open a");
        let b = Region::open(dir.path(), test_info(b"m", b"z", 2), log, None).expect("open b");
        assert!(Region::close_and_merge(&a, &b).is_err());
    }
}
