//! Write-ahead log shared by every region on one server.
//!
//! A single append-only log records all mutations before they reach any
//! memcache. Entries carry a sequence id that is monotonic across all
//! regions hosted here, so "everything up to sequence S is durable in store
//! files" is a meaningful per-region flush point.
//!
//! # File layout
//!
//! The log lives in its own directory, one file per generation:
//!
//! ```text
//! log_<host>_<startcode>_<port>/
//!   hlog.0000000000
//!   hlog.0000000001      <- current
//! ```
//!
//! Rolling seals the current generation and opens the next. A sealed
//! generation is deletable once every region with entries in it has
//! reported a flush at or past its last entry.
//!
//! # Record format
//!
//! One record per commit, so a commit is replayed all-or-nothing:
//!
//! ```text
//! +-----------+---------------------+-----------+
//! |len: u32   | payload             | crc32: u32|
//! +-----------+---------------------+-----------+
//! ```
//!
//! The payload is an entry count followed by the entries. All integers are
//! big-endian; the CRC covers the payload. Replay stops at the first
//! malformed or torn record, which makes a partial tail harmless.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::errcorrupt;
use crate::key::{CellKey, CellValue};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;

/// One logged mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub sequence: u64,
    pub region: Vec<u8>,
    pub key: CellKey,
    pub value: CellValue,
}

/// The server's write-ahead log.
pub struct Hlog {
    dir: PathBuf,
    next_sequence: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    writer: BufWriter<File>,
    file: File,
    generation: u64,
    entry_count: u64,
    /// Highest sequence written per region, current generation only.
    current: HashMap<Vec<u8>, u64>,
    sealed: Vec<SealedGeneration>,
    /// Highest sequence each region has durably flushed to store files.
    flushed: HashMap<Vec<u8>, u64>,
}

struct SealedGeneration {
    generation: u64,
    regions: HashMap<Vec<u8>, u64>,
}

impl std::fmt::Debug for Hlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hlog").field("dir", &self.dir).finish()
    }
}

impl Hlog {
    /// Creates the log directory and the first generation. The directory
    /// must not exist: a leftover directory means another incarnation of
    /// this server is (or was) running against the same root.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            return Err(Error::RegionServerRunning(dir.display().to_string()));
        }
        fs::create_dir_all(&dir)?;

        let (file, writer) = open_generation(&dir, 0)?;
        Ok(Self {
            dir,
            next_sequence: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                writer,
                file,
                generation: 0,
                entry_count: 0,
                current: HashMap::new(),
                sealed: Vec::new(),
                flushed: HashMap::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves the next sequence id.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence id handed out so far.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst) - 1
    }

    /// Raises the sequence counter past `sequence`. Called when a region
    /// opens so fresh edits always sort after everything it replayed.
    pub fn raise_sequence(&self, sequence: u64) {
        let mut current = self.next_sequence.load(Ordering::SeqCst);
        while current <= sequence {
            match self.next_sequence.compare_exchange(
                current,
                sequence + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Appends one commit's entries as a single record and syncs. On return
    /// the entries are durable; on replay they appear all together or not
    /// at all.
    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(entries.len() as u32)?;
        for entry in entries {
            encode_entry(&mut payload, entry)?;
        }
        let checksum = CRC32.checksum(&payload);

        let mut inner = self.inner.lock()?;
        inner.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        inner.writer.write_all(&payload)?;
        inner.writer.write_u32::<BigEndian>(checksum)?;
        inner.writer.flush()?;
        inner.file.sync_data()?;

        inner.entry_count += entries.len() as u64;
        for entry in entries {
            let seq = inner.current.entry(entry.region.clone()).or_insert(0);
            if entry.sequence > *seq {
                *seq = entry.sequence;
            }
        }
        Ok(())
    }

    /// Entries written to the current generation.
    pub fn entry_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.entry_count).unwrap_or(0)
    }

    /// Seals the current generation and opens the next one.
    pub fn roll(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.flush()?;
        inner.file.sync_data()?;

        let generation = inner.generation;
        let regions = std::mem::take(&mut inner.current);
        inner.sealed.push(SealedGeneration { generation, regions });

        let next = generation + 1;
        let (file, writer) = open_generation(&self.dir, next)?;
        inner.file = file;
        inner.writer = writer;
        inner.generation = next;
        inner.entry_count = 0;

        tracing::info!(generation = next, "rolled write-ahead log");
        Ok(())
    }

    /// Records that `region` has flushed everything up to `sequence`.
    pub fn flush_complete(&self, region: &[u8], sequence: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            let seq = inner.flushed.entry(region.to_vec()).or_insert(0);
            if sequence > *seq {
                *seq = sequence;
            }
        }
    }

    /// Deletes sealed generations whose every entry is covered by a flush.
    /// Returns the number of files removed.
    pub fn cleanup(&self) -> Result<usize> {
        let mut inner = self.inner.lock()?;
        let inner = &mut *inner;
        let mut removed = 0;
        let mut keep = Vec::new();
        for sealed in inner.sealed.drain(..) {
            let covered = sealed
                .regions
                .iter()
                .all(|(region, max)| inner.flushed.get(region).is_some_and(|f| f >= max));
            if covered {
                let path = generation_path(&self.dir, sealed.generation);
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete sealed log");
                    keep.push(sealed);
                } else {
                    tracing::debug!(generation = sealed.generation, "deleted sealed log");
                    removed += 1;
                }
            } else {
                keep.push(sealed);
            }
        }
        inner.sealed = keep;
        Ok(removed)
    }

    /// Yields this log's entries for `region` with sequence > `from`, in
    /// sequence order. Flushes the writer first so the current generation
    /// is fully visible.
    pub fn replay(&self, region: &[u8], from: u64) -> Result<Vec<LogEntry>> {
        {
            let mut inner = self.inner.lock()?;
            inner.writer.flush()?;
            inner.file.sync_data()?;
        }
        Self::replay_dir(&self.dir, region, from)
    }

    /// Replays a log directory, typically one left behind by a previous
    /// incarnation. A torn or corrupt tail record ends the replay of that
    /// generation without error.
    pub fn replay_dir(dir: &Path, region: &[u8], from: u64) -> Result<Vec<LogEntry>> {
        let mut generations: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("hlog."))
            })
            .collect();
        generations.sort();

        let mut entries = Vec::new();
        for path in generations {
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                match read_record(&mut reader) {
                    Ok(Some(batch)) => {
                        for entry in batch {
                            if entry.region == region && entry.sequence > from {
                                entries.push(entry);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "truncating log replay at malformed record"
                        );
                        break;
                    }
                }
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Flushes and closes the current generation, leaving files in place
    /// for replay. Used on abort.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Closes the log and removes its directory. Used on clean shutdown,
    /// when every region has already flushed.
    pub fn close_and_delete(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("hlog.{generation:010}"))
}

fn open_generation(dir: &Path, generation: u64) -> Result<(File, BufWriter<File>)> {
    let path = generation_path(dir, generation);
    let file = File::options()
        .create_new(true)
        .read(true)
        .write(true)
        .open(&path)?;
    let writer = BufWriter::new(file.try_clone()?);
    Ok((file, writer))
}

fn encode_entry(payload: &mut Vec<u8>, entry: &LogEntry) -> Result<()> {
    payload.write_u64::<BigEndian>(entry.sequence)?;
    write_bytes(payload, &entry.region)?;
    write_bytes(payload, &entry.key.row)?;
    write_bytes(payload, &entry.key.column)?;
    payload.write_u64::<BigEndian>(entry.key.timestamp)?;
    match &entry.value {
        CellValue::Put(value) => {
            payload.write_u8(TAG_PUT)?;
            write_bytes(payload, value)?;
        }
        CellValue::Delete => payload.write_u8(TAG_DELETE)?,
    }
    Ok(())
}

fn decode_entry(reader: &mut impl Read) -> Result<LogEntry> {
    let sequence = reader.read_u64::<BigEndian>()?;
    let region = read_bytes(reader)?;
    let row = read_bytes(reader)?;
    let column = read_bytes(reader)?;
    let timestamp = reader.read_u64::<BigEndian>()?;
    let value = match reader.read_u8()? {
        TAG_PUT => CellValue::Put(read_bytes(reader)?),
        TAG_DELETE => CellValue::Delete,
        tag => return errcorrupt!("unknown log entry tag {tag}"),
    };
    Ok(LogEntry {
        sequence,
        region,
        key: CellKey::new(row, column, timestamp),
        value,
    })
}

fn write_bytes(payload: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    payload.write_u32::<BigEndian>(bytes.len() as u32)?;
    payload.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes(reader: &mut impl Read) -> Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads one record. Ok(None) on clean EOF; Err on a torn or corrupt tail.
fn read_record(reader: &mut BufReader<File>) -> Result<Option<Vec<LogEntry>>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let stored = reader.read_u32::<BigEndian>()?;
    if CRC32.checksum(&payload) != stored {
        return errcorrupt!("log record checksum mismatch");
    }

    let mut cursor = std::io::Cursor::new(&payload);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(decode_entry(&mut cursor)?);
    }
    Ok(Some(entries))
}
