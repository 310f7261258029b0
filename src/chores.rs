//! The region server's periodic chores: memcache flushing, the
//! split-or-compact check, and log rolling.
//!
//! Chores receive explicit collaborators (registry, log, probe, outbound
//! buffer) rather than the whole server, which keeps them testable and
//! acyclic. Every chore snapshots the online regions under the registry
//! read lock and iterates with the lock released.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{
    insert_region_row, CatalogTable, COL_REGIONINFO, COL_SPLIT_A, COL_SPLIT_B,
};
use crate::chore::Chore;
use crate::error::{Error, Result};
use crate::key;
use crate::master::Outbound;
use crate::region::Region;
use crate::registry::RegionRegistry;
use crate::server::{FilesystemProbe, ServerFlags};
use crate::wal::Hlog;

/// Resolves which catalog table records regions of a given user table:
/// `meta` for user tables, `root` for `meta` itself.
pub trait CatalogAccess: Send + Sync {
    fn catalog_for(&self, table: &str) -> Result<Arc<dyn CatalogTable>>;
}

/// Flushes regions whose memcache has grown past the threshold or gone
/// stale. A `DroppedSnapshot` is fatal: the WAL must be replayed, so the
/// server is asked to stop.
pub struct Flusher {
    pub registry: Arc<RegionRegistry>,
    pub flags: Arc<ServerFlags>,
    pub probe: Arc<FilesystemProbe>,
    pub threshold: usize,
    pub max_interval: Duration,
    pub period: Duration,
}

#[async_trait::async_trait]
impl Chore for Flusher {
    fn name(&self) -> &'static str {
        "flusher"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn step(&self) -> Result<()> {
        for region in self.registry.online_snapshot() {
            if self.flags.stop_requested() || region.is_closed() {
                continue;
            }
            let size = region.memcache_size();
            if size == 0 || (size <= self.threshold && region.since_last_flush() < self.max_interval)
            {
                continue;
            }
            match region.flush() {
                Ok(_) => {}
                Err(Error::DroppedSnapshot(msg)) => {
                    tracing::error!(region = region.name(), %msg, "dropped snapshot, log replay required, stopping server");
                    self.probe.check();
                    self.flags.request_stop();
                    break;
                }
                Err(e) => {
                    tracing::error!(region = region.name(), error = %e, "memcache flush failed");
                    if !self.probe.check() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Compacts stores that have accumulated too many files and splits
/// regions that have outgrown the maximum store size. A split rewrites
/// the catalog and reports to the master; the master assigns the children.
pub struct SplitOrCompactChecker {
    pub registry: Arc<RegionRegistry>,
    pub flags: Arc<ServerFlags>,
    pub probe: Arc<FilesystemProbe>,
    pub outbound: Arc<Outbound>,
    pub catalogs: Arc<dyn CatalogAccess>,
    pub compaction_threshold: usize,
    pub max_filesize: u64,
    pub period: Duration,
}

#[async_trait::async_trait]
impl Chore for SplitOrCompactChecker {
    fn name(&self) -> &'static str {
        "split-or-compact"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn step(&self) -> Result<()> {
        for region in self.registry.online_snapshot() {
            if self.flags.stop_requested() || region.is_closed() {
                continue;
            }
            let result = self.check_region(&region);
            if let Err(e) = result {
                tracing::error!(region = region.name(), error = %e, "split or compaction failed");
                if !self.probe.check() {
                    break;
                }
            }
        }
        Ok(())
    }
}

impl SplitOrCompactChecker {
    fn check_region(&self, region: &Arc<Region>) -> Result<()> {
        if region.needs_compaction(self.compaction_threshold) {
            region.compact(self.compaction_threshold)?;
        }
        // Compaction may have materialized enough data to warrant a split.
        if let Some(mid_key) = region.needs_split(self.max_filesize) {
            self.split(region, &mid_key)?;
        }
        Ok(())
    }

    fn split(&self, region: &Arc<Region>, mid_key: &[u8]) -> Result<()> {
        let table = region.info()?.table;
        let catalog = self.catalogs.catalog_for(&table)?;

        let (child_a, child_b) = region.close_and_split(mid_key, self.registry.as_ref())?;
        let parent = region.info()?; // now marked offline, split

        // Retire the parent row and record the pending children in one
        // commit, then insert one row per child.
        let now = key::now_millis();
        let lock_id = catalog.start_update(&parent.name_bytes())?;
        let result = (|| {
            catalog.put(lock_id, COL_REGIONINFO, parent.encode()?)?;
            catalog.put(lock_id, COL_SPLIT_A, child_a.encode()?)?;
            catalog.put(lock_id, COL_SPLIT_B, child_b.encode()?)?;
            catalog.commit(lock_id, now)
        })();
        if result.is_err() {
            let _ = catalog.abort(lock_id);
            return result;
        }
        insert_region_row(catalog.as_ref(), &child_a, now)?;
        insert_region_row(catalog.as_ref(), &child_b, now)?;

        self.outbound
            .report_split(parent.clone(), child_a.clone(), child_b.clone());
        tracing::info!(
            parent = %parent.region_name(),
            child_a = %child_a.region_name(),
            child_b = %child_b.region_name(),
            "region split, catalog updated and reported"
        );
        // The children are not served here; the master assigns them.
        Ok(())
    }
}

/// Rolls the write-ahead log when the entry count crosses the threshold,
/// then deletes sealed generations that every region has flushed past.
pub struct LogRoller {
    pub log: Arc<Hlog>,
    pub probe: Arc<FilesystemProbe>,
    pub max_entries: u64,
    pub period: Duration,
}

#[async_trait::async_trait]
impl Chore for LogRoller {
    fn name(&self) -> &'static str {
        "log-roller"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn step(&self) -> Result<()> {
        let entries = self.log.entry_count();
        if entries <= self.max_entries {
            return Ok(());
        }
        tracing::info!(entries, "rolling write-ahead log");
        if let Err(e) = self.log.roll().and_then(|_| self.log.cleanup()) {
            tracing::error!(error = %e, "log roll failed");
            self.probe.check();
        }
        Ok(())
    }
}
