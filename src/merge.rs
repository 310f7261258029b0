//! Off-the-hot-path region merging: coalesces adjacent regions that have
//! grown too small, rewriting the catalog as it goes.
//!
//! Two modes share one pass:
//!
//! - [`OnlineMerger`] targets a *disabled* user table while the cluster is
//!   up, working through a catalog handle for `meta`.
//! - [`OfflineMerger`] targets `meta` itself, operating on the locally
//!   opened `root` region. The caller must guarantee no master is running.
//!
//! Each catalog change is a single-row commit: first the two old rows are
//! deleted, then the merged row is inserted with `offline = true` so the
//! master reassigns the region when the table is re-enabled. A crash
//! between steps leaves a row set that is still a valid partition.
//!
//! Scratch state (including the pass's own WAL) lives under
//! `merge_<timestamp>/` and is removed when the pass ends.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::{
    delete_region_row, insert_region_row, root_region_info, CatalogTable, LocalCatalog,
    RegionInfo, META_TABLE, ROOT_TABLE,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::errinput;
use crate::key::now_millis;
use crate::region::{persist_region_info, Region};
use crate::wal::Hlog;

/// Merges adjacent small regions of a disabled user table.
pub struct OnlineMerger<'a> {
    config: &'a Config,
    catalog: &'a dyn CatalogTable,
    table: &'a str,
}

impl<'a> OnlineMerger<'a> {
    pub fn new(config: &'a Config, catalog: &'a dyn CatalogTable, table: &'a str) -> Self {
        Self {
            config,
            catalog,
            table,
        }
    }

    pub fn process(&self) -> Result<usize> {
        if self.table == META_TABLE || self.table == ROOT_TABLE {
            return errinput!("online merge only applies to user tables");
        }
        let pass = MergePass::new(self.config)?;
        let result = pass.run(self.catalog, self.table);
        pass.finish();
        result
    }
}

/// Merges adjacent small `meta` regions through the `root` region.
/// Requires that no master is running against this root directory.
pub struct OfflineMerger<'a> {
    config: &'a Config,
}

impl<'a> OfflineMerger<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn process(&self) -> Result<usize> {
        let pass = MergePass::new(self.config)?;
        let result = (|| {
            let root = Arc::new(Region::open(
                &self.config.root_dir,
                root_region_info(),
                pass.log.clone(),
                None,
            )?);
            let catalog = LocalCatalog::new(root.clone());
            let merges = pass.run(&catalog, META_TABLE)?;
            root.close(false)?;
            Ok(merges)
        })();
        pass.finish();
        result
    }
}

struct MergePass {
    root_dir: PathBuf,
    scratch_dir: PathBuf,
    max_filesize: u64,
    log: Arc<Hlog>,
}

impl MergePass {
    fn new(config: &Config) -> Result<Self> {
        let scratch_dir = config.root_dir.join(format!("merge_{}", now_millis()));
        fs::create_dir_all(&scratch_dir)?;
        let log = Arc::new(Hlog::create(scratch_dir.join("log"))?);
        Ok(Self {
            root_dir: config.root_dir.clone(),
            scratch_dir,
            max_filesize: config.max_filesize,
            log,
        })
    }

    /// One pass over the table's catalog rows in key order, merging each
    /// adjacent pair that fits in half the maximum store size. A pair that
    /// does not fit advances by one, carrying the right-hand region.
    fn run(&self, catalog: &dyn CatalogTable, table: &str) -> Result<usize> {
        let infos: Vec<RegionInfo> = catalog
            .region_infos()?
            .into_iter()
            .filter(|info| info.table == table)
            .collect();
        for info in &infos {
            if !info.offline {
                return Err(Error::TableNotDisabled(table.to_string()));
            }
        }
        // Split parents are offline rows whose data lives on through child
        // references; they are not merge material.
        let candidates: Vec<RegionInfo> =
            infos.into_iter().filter(|info| !info.split).collect();
        if candidates.len() < 2 {
            tracing::info!(table, "fewer than two regions, nothing to merge");
            return Ok(0);
        }

        let mut merges = 0;
        let mut current: Option<(RegionInfo, Region, u64)> = None;
        for next_info in candidates {
            let Some((cur_info, cur_region, cur_size)) = current.take() else {
                current = Some(self.open_measured(next_info)?);
                continue;
            };
            let (next_info, next_region, next_size) = self.open_measured(next_info)?;

            if cur_info.adjacent_to(&next_info)
                && cur_size + next_size <= self.max_filesize / 2
            {
                tracing::info!(
                    a = %cur_info.region_name(),
                    b = %next_info.region_name(),
                    "merging regions"
                );
                let merged = Region::close_and_merge(&cur_region, &next_region)?;
                self.update_catalog(catalog, &cur_info, &next_info, merged)?;
                merges += 1;
            } else {
                tracing::info!(
                    a = %cur_info.region_name(),
                    b = %next_info.region_name(),
                    "not merging regions"
                );
                cur_region.close(false)?;
                current = Some((next_info, next_region, next_size));
            }
        }
        if let Some((_, region, _)) = current {
            region.close(false)?;
        }
        Ok(merges)
    }

    fn open_measured(&self, info: RegionInfo) -> Result<(RegionInfo, Region, u64)> {
        let region = Region::open(&self.root_dir, info.clone(), self.log.clone(), None)?;
        let size = region.largest_store_size();
        Ok((info, region, size))
    }

    /// Deletes the two old rows and inserts the merged one, each as its
    /// own single-row commit. The merged region stays offline so the
    /// master reassigns it when the table comes back.
    fn update_catalog(
        &self,
        catalog: &dyn CatalogTable,
        old_a: &RegionInfo,
        old_b: &RegionInfo,
        mut merged: RegionInfo,
    ) -> Result<()> {
        let now = now_millis();
        delete_region_row(catalog, &old_a.name_bytes(), now)?;
        delete_region_row(catalog, &old_b.name_bytes(), now)?;

        merged.offline = true;
        persist_region_info(&self.root_dir, &merged)?;
        insert_region_row(catalog, &merged, now)?;
        tracing::info!(merged = %merged.region_name(), "catalog updated for merge");
        Ok(())
    }

    /// Best-effort scratch cleanup; the pass result stands either way.
    fn finish(self) {
        if let Err(e) = self.log.close_and_delete() {
            tracing::error!(error = %e, "failed to remove merge log");
        }
        if let Err(e) = fs::remove_dir_all(&self.scratch_dir) {
            tracing::error!(
                dir = %self.scratch_dir.display(),
                error = %e,
                "failed to remove merge scratch directory"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{meta_region_info, FamilyDescriptor};
    use crate::key::LATEST_TIMESTAMP;
    use crate::tmpfs::TempDir;

    fn disabled_region(
        dir: &TempDir,
        log: &Arc<Hlog>,
        table: &str,
        start: &[u8],
        end: &[u8],
        id: u64,
        rows: &[&[u8]],
    ) -> RegionInfo {
        let mut info = RegionInfo::new(
            table,
            start.to_vec(),
            end.to_vec(),
            id,
            vec![FamilyDescriptor::new("f").max_versions(5)],
        );
        let region = Region::open(dir.path(), info.clone(), log.clone(), None).expect("open");
        for row in rows {
            let lock = region.start_update(row).expect("start");
            region.put(lock, b"f:c", row.to_vec()).expect("put");
            region.commit(lock, 1).expect("commit");
        }
        region.close(false).expect("close");
        info.offline = true;
        info
    }

    fn catalog_region(dir: &TempDir, log: &Arc<Hlog>) -> Arc<LocalCatalog> {
        let meta = Arc::new(
            Region::open(
                dir.path(),
                meta_region_info(Vec::new(), Vec::new(), 9000),
                log.clone(),
                None,
            )
            .expect("open meta"),
        );
        Arc::new(LocalCatalog::new(meta))
    }

    #[test]
    fn test_online_merge_coalesces_adjacent_regions() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));
        let catalog = catalog_region(&dir, &log);

        let a = disabled_region(&dir, &log, "t", b"a", b"m", 1, &[b"b", b"c"]);
        let b = disabled_region(&dir, &log, "t", b"m", b"z", 2, &[b"n", b"o"]);
        insert_region_row(catalog.as_ref(), &a, 1).expect("row a");
        insert_region_row(catalog.as_ref(), &b, 1).expect("row b");

        let config = Config::new(dir.path()).max_filesize(64 * 1024 * 1024);
        let merges = OnlineMerger::new(&config, catalog.as_ref(), "t")
            .process()
            .expect("merge");
        assert_eq!(merges, 1);

        let infos: Vec<RegionInfo> = catalog
            .region_infos()
            .expect("infos")
            .into_iter()
            .filter(|i| i.table == "t")
            .collect();
        assert_eq!(infos.len(), 1, "two rows replaced by one");
        let merged = &infos[0];
        assert_eq!(merged.start_key, b"a");
        assert_eq!(merged.end_key, b"z");
        assert!(merged.offline, "merged region left for the master to assign");

        // The merged region serves both halves' cells.
        let merged_region =
            Region::open(dir.path(), merged.clone(), log, None).expect("open merged");
        for row in [b"b".as_slice(), b"c", b"n", b"o"] {
            assert_eq!(
                merged_region
                    .get(row, b"f:c", LATEST_TIMESTAMP, 1)
                    .expect("get"),
                vec![row.to_vec()]
            );
        }

        // Scratch directory is gone.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read root")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("merge_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_merge_skips_oversized_pairs() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));
        let catalog = catalog_region(&dir, &log);

        let a = disabled_region(&dir, &log, "t", b"a", b"m", 1, &[b"b"]);
        let b = disabled_region(&dir, &log, "t", b"m", b"z", 2, &[b"n"]);
        insert_region_row(catalog.as_ref(), &a, 1).expect("row a");
        insert_region_row(catalog.as_ref(), &b, 1).expect("row b");

        // max_filesize/2 == 0, so nothing fits.
        let config = Config::new(dir.path()).max_filesize(1);
        let merges = OnlineMerger::new(&config, catalog.as_ref(), "t")
            .process()
            .expect("merge");
        assert_eq!(merges, 0);
        assert_eq!(
            catalog
                .region_infos()
                .expect("infos")
                .iter()
                .filter(|i| i.table == "t")
                .count(),
            2
        );
    }

    #[test]
    fn test_merge_requires_disabled_table() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));
        let catalog = catalog_region(&dir, &log);

        let mut a = disabled_region(&dir, &log, "t", b"a", b"m", 1, &[b"b"]);
        a.offline = false; // still online
        let b = disabled_region(&dir, &log, "t", b"m", b"z", 2, &[b"n"]);
        insert_region_row(catalog.as_ref(), &a, 1).expect("row a");
        insert_region_row(catalog.as_ref(), &b, 1).expect("row b");

        let config = Config::new(dir.path());
        assert!(matches!(
            OnlineMerger::new(&config, catalog.as_ref(), "t").process(),
            Err(Error::TableNotDisabled(_))
        ));
    }

    #[test]
    fn test_offline_merge_rewrites_root() {
        let dir = TempDir::new().expect("temp dir");
        let log = Arc::new(Hlog::create(dir.path().join("log")).expect("log"));

        // Two small adjacent meta regions, recorded in the root region.
        let m1 = disabled_region(&dir, &log, META_TABLE, b"", b"k", 10, &[b"a", b"b"]);
        let m2 = disabled_region(&dir, &log, META_TABLE, b"k", b"", 11, &[b"p", b"q"]);

        let root = Arc::new(
            Region::open(dir.path(), root_region_info(), log.clone(), None).expect("open root"),
        );
        let root_catalog = LocalCatalog::new(root.clone());
        insert_region_row(&root_catalog, &m1, 1).expect("row m1");
        insert_region_row(&root_catalog, &m2, 1).expect("row m2");
        root.close(false).expect("close root");
        drop(root_catalog);

        let config = Config::new(dir.path()).max_filesize(64 * 1024 * 1024);
        let merges = OfflineMerger::new(&config).process().expect("merge");
        assert_eq!(merges, 1);

        // Re-open root and verify one meta row covering the union.
        let log2 = Arc::new(Hlog::create(dir.path().join("log2")).expect("log2"));
        let root = Arc::new(
            Region::open(dir.path(), root_region_info(), log2, None).expect("reopen root"),
        );
        let catalog = LocalCatalog::new(root);
        let metas: Vec<RegionInfo> = catalog
            .region_infos()
            .expect("infos")
            .into_iter()
            .filter(|i| i.is_meta())
            .collect();
        assert_eq!(metas.len(), 1);
        assert!(metas[0].start_key.is_empty() && metas[0].end_key.is_empty());
        assert!(metas[0].offline);
    }
}
