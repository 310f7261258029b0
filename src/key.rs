//! Cell-level data model: row keys, qualified columns, timestamps.
//!
//! A cell is addressed by `(row, column, timestamp)` where the column is a
//! qualified `family:qualifier` name. Cells sort by row ascending, column
//! ascending, timestamp *descending*, so that the newest version of a cell
//! is always encountered first when iterating in key order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::errinput;

/// Sentinel timestamp meaning "the newest version there is".
pub const LATEST_TIMESTAMP: u64 = u64::MAX;

/// Separator between column family and qualifier.
pub const COLUMN_DELIMITER: u8 = b':';

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the family portion of a qualified column name, delimiter excluded.
pub fn family(column: &[u8]) -> Result<&[u8]> {
    match column.iter().position(|b| *b == COLUMN_DELIMITER) {
        Some(idx) => Ok(&column[..idx]),
        None => errinput!(
            "column {:?} is missing a family delimiter",
            String::from_utf8_lossy(column)
        ),
    }
}

/// The address of one cell version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub column: Vec<u8>,
    pub timestamp: u64,
}

impl CellKey {
    pub fn new(row: impl Into<Vec<u8>>, column: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
            timestamp,
        }
    }

    /// The smallest key for `(row, column)`: the newest version slot.
    pub fn newest(row: impl Into<Vec<u8>>, column: impl Into<Vec<u8>>) -> Self {
        Self::new(row, column, LATEST_TIMESTAMP)
    }

    /// The smallest key for `row`: sorts before every cell of the row.
    pub fn first_in_row(row: impl Into<Vec<u8>>) -> Self {
        Self::new(row, Vec::new(), LATEST_TIMESTAMP)
    }

    /// True when this key names the same `(row, column)` pair as `other`.
    pub fn same_cell(&self, other: &CellKey) -> bool {
        self.row == other.row && self.column == other.column
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            // Newest first: larger timestamps sort earlier.
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A cell payload: either a stored value or a tombstone that shadows all
/// older versions of the same `(row, column)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValue {
    Put(Vec<u8>),
    Delete,
}

impl CellValue {
    pub fn is_delete(&self) -> bool {
        matches!(self, CellValue::Delete)
    }

    /// The stored bytes, or None for a tombstone.
    pub fn as_put(&self) -> Option<&[u8]> {
        match self {
            CellValue::Put(bytes) => Some(bytes),
            CellValue::Delete => None,
        }
    }
}

/// Column selection for scanners: explicit qualified names match exactly,
/// names ending in the delimiter match the whole family.
#[derive(Clone, Debug)]
pub struct ColumnMatcher {
    exact: Vec<Vec<u8>>,
    prefixes: Vec<Vec<u8>>,
}

impl ColumnMatcher {
    pub fn new(specs: &[Vec<u8>]) -> Result<Self> {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for spec in specs {
            family(spec)?;
            if spec.last() == Some(&COLUMN_DELIMITER) {
                prefixes.push(spec.clone());
            } else {
                exact.push(spec.clone());
            }
        }
        Ok(Self { exact, prefixes })
    }

    /// Matches every column.
    pub fn all() -> Self {
        Self {
            exact: Vec::new(),
            prefixes: Vec::new(),
        }
    }

    pub fn matches(&self, column: &[u8]) -> bool {
        if self.exact.is_empty() && self.prefixes.is_empty() {
            return true;
        }
        self.exact.iter().any(|c| c == column)
            || self.prefixes.iter().any(|p| column.starts_with(p))
    }

    /// The families this matcher can possibly select, or None for all.
    pub fn families(&self) -> Option<Vec<Vec<u8>>> {
        if self.exact.is_empty() && self.prefixes.is_empty() {
            return None;
        }
        let mut families: Vec<Vec<u8>> = Vec::new();
        for col in self.exact.iter().chain(self.prefixes.iter()) {
            if let Ok(f) = family(col) {
                if !families.iter().any(|existing| existing == f) {
                    families.push(f.to_vec());
                }
            }
        }
        Some(families)
    }
}
