//! On-disk hash table backing the cache
//!
//! One append-only data file plus an in-memory index from key to the latest
//! record. Each record carries a CRC32C so silent SSD corruption (bit rot) is
//! caught on read. Deletes append a tombstone; dead records are dropped by
//! `compact()` or skipped by `copy_to()`.
//!
//! Record format: RecordHeader (24 bytes) + key_bytes + value_bytes

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::backend::{Backend, CompactionReport};
use crate::config::{Config, VALUE_SIZE_CEILING};
use crate::durability::{durable_sync, read_exact_at, sync_parent_dir};
use crate::error::{StoreError, StoreResult};

/// Magic bytes opening every record: "SLKV"
pub const MAGIC_ARRAY: [u8; 4] = *b"SLKV";

/// Record header size in bytes
const RECORD_HEADER_SIZE: usize = 24;

/// Tombstone flag in the flags byte
const FLAG_TOMBSTONE: u8 = 0x01;

/// Record header.
///
/// Layout:
///   [0..4]   magic:     [u8;4] - "SLKV"
///   [4..6]   key_len:   u16 LE
///   [6..10]  value_len: u32 LE
///   [10..14] checksum:  u32 LE - CRC32C of (key_bytes + value_bytes)
///   [14]     flags:     u8     - bit 0 = tombstone
///   [15..24] reserved, zero
#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    magic: [u8; 4],
    key_len: u16,
    value_len: u32,
    checksum: u32,
    flags: u8,
}

impl RecordHeader {
    fn new(key: &[u8], value: &[u8], flags: u8) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            key_len: key.len() as u16,
            value_len: value.len() as u32,
            checksum: checksum(key, value),
            flags,
        }
    }

    fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.key_len.to_le_bytes());
        buf[6..10].copy_from_slice(&self.value_len.to_le_bytes());
        buf[10..14].copy_from_slice(&self.checksum.to_le_bytes());
        buf[14] = self.flags;
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            key_len: u16::from_le_bytes([buf[4], buf[5]]),
            value_len: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            checksum: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
            flags: buf[14],
        }
    }

    fn is_tombstone(&self) -> bool {
        (self.flags & FLAG_TOMBSTONE) != 0
    }

    fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key_len as usize + self.value_len as usize
    }
}

fn checksum(key: &[u8], value: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(key), value)
}

fn encode_record(key: &[u8], value: &[u8], flags: u8) -> Vec<u8> {
    let header = RecordHeader::new(key, value, flags);
    let mut record = Vec::with_capacity(header.record_len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(key);
    record.extend_from_slice(value);
    record
}

fn io_error<'a>(path: &'a Path, what: &'a str) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |e| StoreError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("{}: {}", what, e),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Scan forward to the next record magic (corruption recovery).
fn find_next_magic(bytes: &[u8], start: usize) -> Option<usize> {
    (start..bytes.len().saturating_sub(3)).find(|&i| bytes[i..i + 4] == MAGIC_ARRAY)
}

/// Where the latest record for a key lives.
#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    key_len: u16,
    value_len: u32,
}

impl Location {
    fn record_len(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.key_len as usize + self.value_len as usize) as u64
    }
}

struct Table {
    file: File,
    size: u64,
    live_bytes: u64,
    index: HashMap<Vec<u8>, Location>,
}

impl Table {
    /// Open (or create) the data file and rebuild the index from it.
    ///
    /// Records are judged by the format alone, never by the current config,
    /// so reopening with smaller limits keeps every record readable. A damaged
    /// record is skipped by resynchronising on the next magic; only bytes past
    /// the last verified record are truncated.
    fn load(path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(io_error(path, "Failed to open hash table"))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(io_error(path, "Failed to read hash table"))?;

        let mut index: HashMap<Vec<u8>, Location> = HashMap::new();
        let mut offset = 0usize;
        let mut valid_end = 0usize;

        while offset + RECORD_HEADER_SIZE <= bytes.len() {
            let header = RecordHeader::from_bytes(&bytes[offset..offset + RECORD_HEADER_SIZE]);

            let end = offset + header.record_len();
            let key_end = offset + RECORD_HEADER_SIZE + header.key_len as usize;

            let problem = if header.magic != MAGIC_ARRAY || header.value_len as usize > VALUE_SIZE_CEILING {
                Some("bad record header")
            } else if end > bytes.len() {
                // torn tail, or a damaged length field mid-file
                Some("record runs past end of file")
            } else if checksum(&bytes[offset + RECORD_HEADER_SIZE..key_end], &bytes[key_end..end])
                != header.checksum
            {
                Some("checksum mismatch")
            } else {
                None
            };

            if let Some(problem) = problem {
                warn!(path = %path.display(), offset, problem, "skipping record, scanning for next one");
                match find_next_magic(&bytes, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let key = &bytes[offset + RECORD_HEADER_SIZE..key_end];

            if header.is_tombstone() {
                index.remove(key);
            } else {
                index.insert(key.to_vec(), Location {
                    offset: offset as u64,
                    key_len: header.key_len,
                    value_len: header.value_len,
                });
            }
            offset = end;
            valid_end = end;
        }

        // the scan resyncs past every damaged record, so nothing after
        // `valid_end` passed its checksum
        if valid_end < bytes.len() {
            warn!(
                path = %path.display(),
                valid_end,
                discarded = bytes.len() - valid_end,
                "truncating unverifiable tail"
            );
            file.set_len(valid_end as u64)
                .map_err(io_error(path, "Failed to truncate torn tail"))?;
        }

        let live_bytes = index.values().map(Location::record_len).sum();
        Ok(Self { file, size: valid_end as u64, live_bytes, index })
    }

    fn append(&mut self, path: &Path, record: &[u8]) -> StoreResult<u64> {
        let offset = self.size;
        if let Err(e) = self.file.write_all(record) {
            // a partial record may be on disk; keep `size` honest so later
            // offsets stay right, recovery skips the fragment
            if let Ok(meta) = self.file.metadata() {
                self.size = meta.len();
            }
            return Err(io_error(path, "Hash table write failed")(e));
        }
        self.size += record.len() as u64;
        Ok(offset)
    }

    fn read_value(&self, path: &Path, loc: Location) -> StoreResult<Vec<u8>> {
        let mut record = vec![0u8; loc.record_len() as usize];
        read_exact_at(&self.file, &mut record, loc.offset)
            .map_err(io_error(path, "Hash table read failed"))?;

        let header = RecordHeader::from_bytes(&record[..RECORD_HEADER_SIZE]);
        if header.magic != MAGIC_ARRAY {
            return Err(StoreError::Corrupted {
                path: path.to_path_buf(),
                offset: loc.offset,
                reason: format!("magic {:02x?} where a record was indexed", header.magic),
            });
        }

        let key_end = RECORD_HEADER_SIZE + loc.key_len as usize;
        let actual = checksum(&record[RECORD_HEADER_SIZE..key_end], &record[key_end..]);
        if actual != header.checksum {
            return Err(StoreError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: header.checksum,
                actual,
                offset: loc.offset,
            });
        }

        record.drain(..key_end);
        Ok(record)
    }

    fn read_prefix(&self, path: &Path, loc: Location, dst: &mut [u8]) -> StoreResult<usize> {
        let n = dst.len().min(loc.value_len as usize);
        let start = loc.offset + RECORD_HEADER_SIZE as u64 + loc.key_len as u64;
        read_exact_at(&self.file, &mut dst[..n], start)
            .map_err(io_error(path, "Hash table read failed"))?;
        Ok(n)
    }

    /// Write every live record to `dest` using the atomic rename pattern:
    /// 1. write `dest.tmp`
    /// 2. durable_sync it
    /// 3. rename over `dest`
    /// 4. durable_sync the directory
    fn write_live(&self, path: &Path, dest: &Path) -> StoreResult<(HashMap<Vec<u8>, Location>, u64)> {
        let tmp = with_suffix(dest, ".tmp");
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(io_error(&tmp, "Failed to create table copy"))?;

        // read in file order to keep the scan sequential
        let mut live: Vec<(Vec<u8>, Location)> =
            self.index.iter().map(|(k, loc)| (k.clone(), *loc)).collect();
        live.sort_by_key(|(_, loc)| loc.offset);

        let mut index = HashMap::with_capacity(live.len());
        let mut size = 0u64;
        for (key, loc) in live {
            let value = self.read_value(path, loc)?;
            let record = encode_record(&key, &value, 0);
            out.write_all(&record)
                .map_err(io_error(&tmp, "Failed to write table copy"))?;
            index.insert(key, Location { offset: size, ..loc });
            size += record.len() as u64;
        }

        durable_sync(&out).map_err(io_error(&tmp, "Failed to sync table copy"))?;
        drop(out);

        fs::rename(&tmp, dest).map_err(io_error(dest, "Failed to rename table copy"))?;
        sync_parent_dir(dest).map_err(io_error(dest, "Failed to sync directory after rename"))?;

        Ok((index, size))
    }
}

/// Durable hash table: append-only data file + in-memory index.
///
/// All methods take `&self`. Reads share the table and use positional I/O;
/// appends, deletes and compaction take it exclusively.
pub struct HashDb {
    path: PathBuf,
    table: RwLock<Table>,
    last_error: Mutex<Option<String>>,
    max_key_size: usize,
    max_value_size: usize,
}

impl HashDb {
    /// Open or create the table at `path`, replaying its records.
    ///
    /// Corrupt records are skipped and a torn tail is truncated.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(io_error(parent, "Failed to create table directory"))?;
        }

        let table = Table::load(&path)?;
        info!(
            path = %path.display(),
            records = table.index.len(),
            bytes = table.size,
            dead_bytes = table.size - table.live_bytes,
            "opened hash table"
        );

        Ok(Self {
            path,
            table: RwLock::new(table),
            last_error: Mutex::new(None),
            max_key_size: config.max_key_size,
            max_value_size: config.max_value_size,
        })
    }

    /// Data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current data file size in bytes, dead records included.
    pub fn file_size(&self) -> u64 {
        self.table.read().size
    }

    fn track<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e) = &result {
            *self.last_error.lock() = Some(e.to_string());
        }
        result
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if key.len() > self.max_key_size {
            return Err(StoreError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.max_key_size as u64,
                component: "key".to_string(),
            });
        }
        if value.len() > self.max_value_size {
            return Err(StoreError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.max_value_size as u64,
                component: "value".to_string(),
            });
        }
        Ok(())
    }
}

impl Backend for HashDb {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let table = self.table.read();
        let result = match table.index.get(key).copied() {
            Some(loc) => table.read_value(&self.path, loc).map(Some),
            None => Ok(None),
        };
        self.track(result)
    }

    fn get_into(&self, key: &[u8], buf: &mut [u8]) -> StoreResult<Option<usize>> {
        let table = self.table.read();
        let result = match table.index.get(key).copied() {
            Some(loc) => table.read_prefix(&self.path, loc, buf).map(Some),
            None => Ok(None),
        };
        self.track(result)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let result = self.check_sizes(key, value).and_then(|_| {
            let record = encode_record(key, value, 0);
            let mut table = self.table.write();
            let offset = table.append(&self.path, &record)?;
            let loc = Location { offset, key_len: key.len() as u16, value_len: value.len() as u32 };
            table.live_bytes += loc.record_len();
            if let Some(prev) = table.index.insert(key.to_vec(), loc) {
                table.live_bytes -= prev.record_len();
            }
            Ok(())
        });
        self.track(result)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        let mut table = self.table.write();
        if !table.index.contains_key(key) {
            return Ok(false);
        }
        let record = encode_record(key, &[], FLAG_TOMBSTONE);
        let result = table.append(&self.path, &record).map(|_| {
            if let Some(prev) = table.index.remove(key) {
                table.live_bytes -= prev.record_len();
            }
            true
        });
        drop(table);
        self.track(result)
    }

    fn value_size(&self, key: &[u8]) -> StoreResult<Option<usize>> {
        let table = self.table.read();
        Ok(table.index.get(key).map(|loc| loc.value_len as usize))
    }

    fn sync(&self) -> StoreResult<()> {
        let table = self.table.read();
        let result = durable_sync(&table.file)
            .map_err(io_error(&self.path, "Hash table durable_sync failed"));
        drop(table);
        self.track(result)
    }

    fn copy_to(&self, dest: &Path) -> StoreResult<()> {
        if dest == self.path {
            return self.track(Err(StoreError::Io {
                path: Some(dest.to_path_buf()),
                kind: std::io::ErrorKind::InvalidInput,
                message: "copy destination is the live table".to_string(),
            }));
        }
        let table = self.table.read();
        let result = table.write_live(&self.path, dest).map(|(index, size)| {
            info!(dest = %dest.display(), records = index.len(), bytes = size, "copied hash table");
        });
        drop(table);
        self.track(result)
    }

    fn record_count(&self) -> u64 {
        self.table.read().index.len() as u64
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn keys(&self) -> StoreResult<Vec<Vec<u8>>> {
        Ok(self.table.read().index.keys().cloned().collect())
    }

    fn dead_ratio(&self) -> f64 {
        let table = self.table.read();
        if table.size == 0 {
            return 0.0;
        }
        1.0 - table.live_bytes as f64 / table.size as f64
    }

    fn compact(&self) -> StoreResult<Option<CompactionReport>> {
        let mut table = self.table.write();
        let bytes_before = table.size;

        let result = table.write_live(&self.path, &self.path).and_then(|(index, size)| {
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(&self.path)
                .map_err(io_error(&self.path, "Failed to reopen compacted table"))?;
            table.file = file;
            table.index = index;
            table.size = size;
            table.live_bytes = size;
            Ok(CompactionReport {
                live_records: table.index.len() as u64,
                bytes_before,
                bytes_after: size,
            })
        });
        drop(table);

        let report = self.track(result)?;
        info!(
            path = %self.path.display(),
            records = report.live_records,
            saved = report.bytes_saved(),
            "compacted hash table"
        );
        Ok(Some(report))
    }
}
