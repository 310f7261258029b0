//! The set of regions this server is hosting.
//!
//! Two maps under one readers-writer lock: `online` (serving reads and
//! writes) and `retiring` (mid-close, answering reads only until pending
//! requests drain). A region name lives in at most one of the two. RPC
//! handlers take the read lock; open/close take the write lock; chores
//! snapshot the online values under the read lock and release it before
//! touching any region, so no chore holds the registry across I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::errinput;
use crate::region::{Region, RegionUnavailableListener};

#[derive(Default)]
struct Maps {
    online: BTreeMap<String, Arc<Region>>,
    retiring: HashMap<String, Arc<Region>>,
}

#[derive(Default)]
pub struct RegionRegistry {
    maps: RwLock<Maps>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a region name, optionally searching the retiring map as
    /// well (commit and put follow a row lock into a retiring region).
    pub fn lookup(&self, name: &str, include_retiring: bool) -> Result<Arc<Region>> {
        let maps = self.maps.read()?;
        if let Some(region) = maps.online.get(name) {
            return Ok(region.clone());
        }
        if include_retiring {
            if let Some(region) = maps.retiring.get(name) {
                return Ok(region.clone());
            }
        }
        Err(Error::NotServingRegion(name.to_string()))
    }

    /// Registers a freshly opened region. Rejected when the name is
    /// already present in either map.
    pub fn open(&self, region: Arc<Region>) -> Result<()> {
        let name = region.name().to_string();
        let mut maps = self.maps.write()?;
        if maps.online.contains_key(&name) || maps.retiring.contains_key(&name) {
            return errinput!("region {name} is already registered");
        }
        maps.online.insert(name, region);
        Ok(())
    }

    /// Moves a region from online to retiring, returning it. The region
    /// keeps answering reads until `end_close`.
    pub fn begin_close(&self, name: &str) -> Result<Arc<Region>> {
        let mut maps = self.maps.write()?;
        let region = maps
            .online
            .remove(name)
            .ok_or_else(|| Error::NotServingRegion(name.to_string()))?;
        maps.retiring.insert(name.to_string(), region.clone());
        Ok(region)
    }

    /// Evicts a retiring region.
    pub fn end_close(&self, name: &str) {
        if let Ok(mut maps) = self.maps.write() {
            maps.retiring.remove(name);
        }
    }

    /// Removes a region from whichever map holds it, for close paths that
    /// skip the retiring phase (master CLOSE, shutdown).
    pub fn remove(&self, name: &str) -> Option<Arc<Region>> {
        let mut maps = self.maps.write().ok()?;
        maps.online.remove(name).or_else(|| maps.retiring.remove(name))
    }

    /// Snapshot of the online regions, taken under the read lock.
    pub fn online_snapshot(&self) -> Vec<Arc<Region>> {
        self.maps
            .read()
            .map(|maps| maps.online.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drains every online region, for shutdown and restart.
    pub fn drain(&self) -> Vec<Arc<Region>> {
        self.maps
            .write()
            .map(|mut maps| {
                let drained = std::mem::take(&mut maps.online);
                drained.into_values().collect()
            })
            .unwrap_or_default()
    }

    pub fn online_count(&self) -> usize {
        self.maps.read().map(|maps| maps.online.len()).unwrap_or(0)
    }
}

/// The registry is the split listener: `closing` retires the region,
/// `closed` evicts it.
impl RegionUnavailableListener for RegionRegistry {
    fn closing(&self, region_name: &str) {
        match self.begin_close(region_name) {
            Ok(_) => tracing::debug!(region = region_name, "moved to retiring"),
            Err(e) => tracing::warn!(region = region_name, error = %e, "closing unknown region"),
        }
    }

    fn closed(&self, region_name: &str) {
        self.end_close(region_name);
        tracing::debug!(region = region_name, "evicted from retiring");
    }
}
