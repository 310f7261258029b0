use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// A restarting server may race the previous incarnation's shutdown by a
/// moment; retry that long before declaring the root taken.
const ACQUIRE_ATTEMPTS: u32 = 3;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(50);

/// Exclusive ownership marker for a server root directory.
///
/// The lock itself is the kernel's: it vanishes with the file handle, so a
/// crashed owner never wedges the root. The file body records who holds it
/// (`pid <n>`), which the contention error reports back, and is scrubbed
/// on clean release so a stale record is itself a crash indicator.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut attempt = 1;
        loop {
            match Self::try_exclusive(&file) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempt < ACQUIRE_ATTEMPTS => {
                    tracing::debug!(
                        path = %path.display(),
                        attempt,
                        "root directory lock busy, retrying"
                    );
                    attempt += 1;
                    std::thread::sleep(ACQUIRE_BACKOFF);
                }
                Err(e) => {
                    let detail = match Self::read_owner(&mut file) {
                        Some(owner) => format!("root directory lock held by {owner}"),
                        None => "root directory lock held by another server".to_string(),
                    };
                    return Err(io::Error::new(e.kind(), detail));
                }
            }
        }

        // Ours now; replace whatever record the previous owner left.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "pid {}", std::process::id())?;
        file.sync_all()?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_owner(file: &mut File) -> Option<String> {
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0)).ok()?;
        file.read_to_string(&mut contents).ok()?;
        let line = contents.lines().next()?.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    #[cfg(unix)]
    fn try_exclusive(file: &File) -> io::Result<()> {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn try_exclusive(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; the log-directory existence
        // check still refuses a double start.
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Scrub the owner record on clean release; the kernel drops the
        // lock with the handle.
        let _ = self.file.set_len(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_contention_names_the_owner() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("server.lock");

        let held = DirLock::acquire(&path).expect("first lock");
        assert_eq!(held.path(), path.as_path());

        // flock is per open file description, so a second acquire from this
        // process contends exactly as another process would.
        #[cfg(unix)]
        {
            let err = match DirLock::acquire(&path) {
                Err(e) => e,
                Ok(_) => panic!("second acquire should contend"),
            };
            assert!(
                err.to_string().contains(&format!("pid {}", std::process::id())),
                "error should name the owner: {err}"
            );
        }

        drop(held);
        let _again = DirLock::acquire(&path).expect("relock after release");
    }

    #[test]
    fn test_clean_release_scrubs_owner_record() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("server.lock");

        drop(DirLock::acquire(&path).expect("lock"));
        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.is_empty(), "owner record should be scrubbed");
    }
}
