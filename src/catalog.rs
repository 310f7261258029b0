//! Catalog data model: region descriptors and the well-known `root` and
//! `meta` tables that map region ranges to their hosting servers.
//!
//! The catalog is itself a table, mutated with the same row-lock discipline
//! as user data. A catalog row is keyed by region name and carries the
//! serialized descriptor plus server assignment columns.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::{ColumnMatcher, LATEST_TIMESTAMP};
use crate::region::Region;

/// Table of regions that describe `meta` regions.
pub const ROOT_TABLE: &str = "root";
/// Table of regions that describe user regions.
pub const META_TABLE: &str = "meta";

pub const COL_REGIONINFO: &[u8] = b"info:regioninfo";
pub const COL_SERVER: &[u8] = b"info:server";
pub const COL_STARTCODE: &[u8] = b"info:startcode";
pub const COL_SPLIT_A: &[u8] = b"info:splitA";
pub const COL_SPLIT_B: &[u8] = b"info:splitB";

/// Schema of one column family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyDescriptor {
    pub name: String,
    /// Versions of a cell retained past compaction.
    pub max_versions: u32,
    /// Tombstones older than this are dropped during compaction.
    pub ttl_millis: Option<u64>,
}

impl FamilyDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_versions: 3,
            ttl_millis: None,
        }
    }

    pub fn max_versions(mut self, versions: u32) -> Self {
        self.max_versions = versions;
        self
    }

    pub fn ttl_millis(mut self, ttl: u64) -> Self {
        self.ttl_millis = Some(ttl);
        self
    }
}

/// Serialized descriptor of one region: the unit of assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_id: u64,
    pub offline: bool,
    pub split: bool,
    pub families: Vec<FamilyDescriptor>,
}

impl RegionInfo {
    pub fn new(
        table: impl Into<String>,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        region_id: u64,
        families: Vec<FamilyDescriptor>,
    ) -> Self {
        Self {
            table: table.into(),
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
            offline: false,
            split: false,
            families,
        }
    }

    /// The region name: `<table>,<startkey-hex>,<id>`. Doubles as the
    /// catalog row key, so names sort by table then start key.
    pub fn region_name(&self) -> String {
        let mut hex = String::with_capacity(self.start_key.len() * 2);
        for byte in &self.start_key {
            let _ = write!(hex, "{byte:02x}");
        }
        format!("{},{},{}", self.table, hex, self.region_id)
    }

    pub fn name_bytes(&self) -> Vec<u8> {
        self.region_name().into_bytes()
    }

    /// True when `row` falls in this region's half-open key range. An empty
    /// start key is unbounded below, an empty end key unbounded above.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        (self.start_key.is_empty() || row >= self.start_key.as_slice())
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }

    /// True when `other`'s range is immediately to the right of this one.
    pub fn adjacent_to(&self, other: &RegionInfo) -> bool {
        self.table == other.table && !self.end_key.is_empty() && self.end_key == other.start_key
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn is_root(&self) -> bool {
        self.table == ROOT_TABLE
    }

    pub fn is_meta(&self) -> bool {
        self.table == META_TABLE
    }
}

/// The fixed descriptor of the single `root` region.
pub fn root_region_info() -> RegionInfo {
    RegionInfo::new(
        ROOT_TABLE,
        Vec::new(),
        Vec::new(),
        0,
        vec![FamilyDescriptor::new("info").max_versions(1)],
    )
}

/// Descriptor for a `meta` region covering the given range.
pub fn meta_region_info(start_key: Vec<u8>, end_key: Vec<u8>, region_id: u64) -> RegionInfo {
    RegionInfo::new(
        META_TABLE,
        start_key,
        end_key,
        region_id,
        vec![FamilyDescriptor::new("info").max_versions(1)],
    )
}

/// Row-mutation access to a catalog table.
///
/// Implemented locally over an open catalog region; a client stub over the
/// wire would implement the same trait. Mutations follow the row-lock
/// discipline of any table: each visible change is one single-row commit.
pub trait CatalogTable: Send + Sync {
    fn start_update(&self, row: &[u8]) -> Result<u64>;
    fn put(&self, lock_id: u64, column: &[u8], value: Vec<u8>) -> Result<()>;
    fn delete(&self, lock_id: u64, column: &[u8]) -> Result<()>;
    fn commit(&self, lock_id: u64, timestamp: u64) -> Result<()>;
    fn abort(&self, lock_id: u64) -> Result<()>;

    /// All region descriptors recorded in this catalog, in row order.
    fn region_infos(&self) -> Result<Vec<RegionInfo>>;
}

/// Catalog access backed by a locally open region.
pub struct LocalCatalog {
    region: Arc<Region>,
}

impl LocalCatalog {
    pub fn new(region: Arc<Region>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }
}

impl CatalogTable for LocalCatalog {
    fn start_update(&self, row: &[u8]) -> Result<u64> {
        self.region.start_update(row)
    }

    fn put(&self, lock_id: u64, column: &[u8], value: Vec<u8>) -> Result<()> {
        self.region.put(lock_id, column, value)
    }

    fn delete(&self, lock_id: u64, column: &[u8]) -> Result<()> {
        self.region.delete(lock_id, column)
    }

    fn commit(&self, lock_id: u64, timestamp: u64) -> Result<()> {
        self.region.commit(lock_id, timestamp)
    }

    fn abort(&self, lock_id: u64) -> Result<()> {
        self.region.abort(lock_id)
    }

    fn region_infos(&self) -> Result<Vec<RegionInfo>> {
        let matcher = ColumnMatcher::new(&[COL_REGIONINFO.to_vec()])?;
        let mut scanner = self
            .region
            .scanner(matcher, Vec::new(), LATEST_TIMESTAMP, None)?;
        let mut infos = Vec::new();
        while let Some((_, columns)) = scanner.next_row()? {
            if let Some(bytes) = columns.get(COL_REGIONINFO) {
                infos.push(RegionInfo::decode(bytes)?);
            }
        }
        Ok(infos)
    }
}

/// Deletes a region's catalog row (descriptor plus assignment columns) as
/// one commit, and aborts the update on any failure.
pub fn delete_region_row(catalog: &dyn CatalogTable, row: &[u8], timestamp: u64) -> Result<()> {
    let lock_id = catalog.start_update(row)?;
    let result = (|| {
        catalog.delete(lock_id, COL_REGIONINFO)?;
        catalog.delete(lock_id, COL_SERVER)?;
        catalog.delete(lock_id, COL_STARTCODE)?;
        catalog.commit(lock_id, timestamp)
    })();
    if result.is_err() {
        let _ = catalog.abort(lock_id);
    }
    result
}

/// Inserts a region descriptor row as one commit.
pub fn insert_region_row(
    catalog: &dyn CatalogTable,
    info: &RegionInfo,
    timestamp: u64,
) -> Result<()> {
    let lock_id = catalog.start_update(&info.name_bytes())?;
    let result = (|| {
        catalog.put(lock_id, COL_REGIONINFO, info.encode()?)?;
        catalog.commit(lock_id, timestamp)
    })();
    if result.is_err() {
        let _ = catalog.abort(lock_id);
    }
    result
}
