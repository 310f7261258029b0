//! Immutable on-disk sorted runs of cells, one file per flush.
//!
//! # Format
//!
//! ```text
//! +----------+----------+-----+-------------+---------+
//! | block 0  | block 1  | ... | index block | trailer |
//! +----------+----------+-----+-------------+---------+
//! ```
//!
//! Data blocks hold cells in `(row, column, timestamp desc)` order. Each
//! block is independently framed `len | payload | crc32` so corruption is
//! detected at block granularity. The index block maps each data block's
//! first cell key to its offset; the fixed-size trailer locates the index
//! and records the flush sequence id the file covers.
//!
//! Readers keep the index in memory and open their own file handle per
//! scan, so concurrent scans never contend on a shared cursor.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::errcorrupt;
use crate::key::{CellKey, CellValue};
use crate::wal::CRC32;

const MAX_BLOCK_SIZE: usize = 8 * 1024;
const MAGIC: u32 = 0xC1DB_5F01;
const TRAILER_SIZE: u64 = 8 + 4 + 8 + 8 + 4;

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;

#[derive(Clone, Debug)]
struct IndexEntry {
    first: CellKey,
    offset: u64,
    len: u32,
}

/// Sequential writer. Cells must be added in cell-key order; the caller
/// (a flush or compaction) already iterates sorted sources.
pub struct StoreFileWriter {
    file: File,
    writer: BufWriter<File>,
    block: Vec<u8>,
    block_entries: u32,
    block_first: Option<CellKey>,
    index: Vec<IndexEntry>,
    offset: u64,
    entry_count: u64,
    flush_sequence: u64,
}

impl StoreFileWriter {
    /// Creates a new store file covering WAL entries up to `flush_sequence`.
    pub fn create(path: &Path, flush_sequence: u64) -> Result<Self> {
        let file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            block: Vec::new(),
            block_entries: 0,
            block_first: None,
            index: Vec::new(),
            offset: 0,
            entry_count: 0,
            flush_sequence,
        })
    }

    pub fn add(&mut self, key: &CellKey, value: &CellValue) -> Result<()> {
        if self.block_first.is_none() {
            self.block_first = Some(key.clone());
        }
        encode_cell(&mut self.block, key, value)?;
        self.block_entries += 1;
        self.entry_count += 1;
        if self.block.len() >= MAX_BLOCK_SIZE {
            self.finish_block()?;
        }
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        let Some(first) = self.block_first.take() else {
            return Ok(());
        };
        let mut payload = Vec::with_capacity(self.block.len() + 4);
        payload.write_u32::<BigEndian>(self.block_entries)?;
        payload.extend_from_slice(&self.block);

        let len = write_framed(&mut self.writer, &payload)?;
        self.index.push(IndexEntry {
            first,
            offset: self.offset,
            len,
        });
        self.offset += len as u64;
        self.block.clear();
        self.block_entries = 0;
        Ok(())
    }

    /// Writes the index and trailer and syncs. The file is complete and
    /// readable once this returns.
    pub fn finish(mut self) -> Result<u64> {
        self.finish_block()?;

        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(self.index.len() as u32)?;
        for entry in &self.index {
            encode_key(&mut payload, &entry.first)?;
            payload.write_u64::<BigEndian>(entry.offset)?;
            payload.write_u32::<BigEndian>(entry.len)?;
        }
        let index_offset = self.offset;
        let index_len = write_framed(&mut self.writer, &payload)?;

        self.writer.write_u64::<BigEndian>(index_offset)?;
        self.writer.write_u32::<BigEndian>(index_len)?;
        self.writer.write_u64::<BigEndian>(self.entry_count)?;
        self.writer.write_u64::<BigEndian>(self.flush_sequence)?;
        self.writer.write_u32::<BigEndian>(MAGIC)?;
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(self.entry_count)
    }
}

/// Open store file with its block index resident in memory.
#[derive(Debug)]
pub struct StoreFileReader {
    path: PathBuf,
    index: Vec<IndexEntry>,
    entry_count: u64,
    flush_sequence: u64,
    size: u64,
}

impl StoreFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < TRAILER_SIZE {
            return errcorrupt!("store file {} too short", path.display());
        }

        file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        let index_len = file.read_u32::<BigEndian>()?;
        let entry_count = file.read_u64::<BigEndian>()?;
        let flush_sequence = file.read_u64::<BigEndian>()?;
        if file.read_u32::<BigEndian>()? != MAGIC {
            return errcorrupt!("store file {} has a bad magic number", path.display());
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let payload = read_framed(&mut file, index_len)?;
        let mut cursor = std::io::Cursor::new(&payload);
        let count = cursor.read_u32::<BigEndian>()?;
        let mut index = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let first = decode_key(&mut cursor)?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()?;
            index.push(IndexEntry { first, offset, len });
        }

        Ok(Self {
            path: path.to_path_buf(),
            index,
            entry_count,
            flush_sequence,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// The WAL sequence id this file's contents are durable through.
    pub fn flush_sequence(&self) -> u64 {
        self.flush_sequence
    }

    /// The first row of the middle block, used as a split point candidate.
    pub fn mid_row(&self) -> Option<Vec<u8>> {
        if self.index.is_empty() {
            return None;
        }
        Some(self.index[self.index.len() / 2].first.row.clone())
    }

    /// Cursor over all cells at or after `start`, in cell-key order.
    pub fn scan(&self, start: Option<&CellKey>) -> Result<StoreFileCursor> {
        // The target block is the last one whose first key is <= start.
        let begin = match start {
            Some(key) => match self.index.partition_point(|e| e.first <= *key) {
                0 => 0,
                n => n - 1,
            },
            None => 0,
        };
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(StoreFileCursor {
            reader,
            blocks: self.index[begin..].to_vec(),
            pending: VecDeque::new(),
            start: start.cloned(),
        })
    }
}

/// Owned scan cursor; decodes one block at a time.
pub struct StoreFileCursor {
    reader: BufReader<File>,
    blocks: Vec<IndexEntry>,
    pending: VecDeque<(CellKey, CellValue)>,
    start: Option<CellKey>,
}

impl StoreFileCursor {
    fn load_next_block(&mut self) -> Result<bool> {
        if self.blocks.is_empty() {
            return Ok(false);
        }
        let entry = self.blocks.remove(0);
        self.reader.seek(SeekFrom::Start(entry.offset))?;
        let payload = read_framed(&mut self.reader, entry.len)?;
        let mut cursor = std::io::Cursor::new(&payload);
        let count = cursor.read_u32::<BigEndian>()?;
        for _ in 0..count {
            let (key, value) = decode_cell(&mut cursor)?;
            if let Some(start) = &self.start {
                if key < *start {
                    continue;
                }
            }
            self.pending.push_back((key, value));
        }
        Ok(true)
    }
}

impl Iterator for StoreFileCursor {
    type Item = Result<(CellKey, CellValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.pending.pop_front() {
                return Some(Ok(cell));
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.blocks.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

fn write_framed(writer: &mut impl Write, payload: &[u8]) -> Result<u32> {
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
    Ok(payload.len() as u32 + 8)
}

fn read_framed(reader: &mut impl Read, framed_len: u32) -> Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len + 8 != framed_len as usize {
        return errcorrupt!("block length {len} does not match index");
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let stored = reader.read_u32::<BigEndian>()?;
    if CRC32.checksum(&payload) != stored {
        return errcorrupt!("block checksum mismatch");
    }
    Ok(payload)
}

fn encode_key(buf: &mut Vec<u8>, key: &CellKey) -> Result<()> {
    buf.write_u32::<BigEndian>(key.row.len() as u32)?;
    buf.extend_from_slice(&key.row);
    buf.write_u32::<BigEndian>(key.column.len() as u32)?;
    buf.extend_from_slice(&key.column);
    buf.write_u64::<BigEndian>(key.timestamp)?;
    Ok(())
}

fn decode_key(reader: &mut impl Read) -> Result<CellKey> {
    let row = read_bytes(reader)?;
    let column = read_bytes(reader)?;
    let timestamp = reader.read_u64::<BigEndian>()?;
    Ok(CellKey::new(row, column, timestamp))
}

fn encode_cell(buf: &mut Vec<u8>, key: &CellKey, value: &CellValue) -> Result<()> {
    encode_key(buf, key)?;
    match value {
        CellValue::Put(bytes) => {
            buf.write_u8(TAG_PUT)?;
            buf.write_u32::<BigEndian>(bytes.len() as u32)?;
            buf.extend_from_slice(bytes);
        }
        CellValue::Delete => buf.write_u8(TAG_DELETE)?,
    }
    Ok(())
}

fn decode_cell(reader: &mut impl Read) -> Result<(CellKey, CellValue)> {
    let key = decode_key(reader)?;
    let value = match reader.read_u8()? {
        TAG_PUT => CellValue::Put(read_bytes(reader)?),
        TAG_DELETE => CellValue::Delete,
        tag => return errcorrupt!("unknown cell tag {tag}"),
    };
    Ok((key, value))
}

fn read_bytes(reader: &mut impl Read) -> Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
