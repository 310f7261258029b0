//! Throwaway server roots for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Distinguishes scratch roots created by this process; combined with the
/// pid it makes every path fresh, so construction never has to clear a
/// leftover directory.
static NEXT_SCRATCH_ID: AtomicU64 = AtomicU64::new(0);

/// A scratch directory standing in for a server root. Removed, with
/// everything a test grew under it (logs, region dirs, merge scratch),
/// when dropped.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let id = NEXT_SCRATCH_ID.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir()
            .join("cinderdb")
            .join(format!("{}-{id}", std::process::id()));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
