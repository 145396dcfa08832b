//! Embedded key-value store backing the folder and sector indexes.
//!
//! All pairs live in a `BTreeMap`. Every mutation is appended to `meta.log`
//! and synced before it becomes visible; `compact` folds the map into
//! `meta.snapshot` and empties the log.
//!
//! ```text
//! +-------------------+
//! | checksum          | u32, crc32 of the rest of the record
//! +-------------------+
//! | key length        | u32
//! +-------------------+
//! | value length      | u32, 0 for a removal
//! +-------------------+
//! | key               | variant length
//! +-------------------+
//! | value             | variant length
//! +-------------------+
//! ```
use crate::byteutils::u32_from_le_bytes;
use crate::error::SectorStoreError;
use crate::ioutils::{read_bytes_exact, sync_dir, BufReaderWithPos, BufWriterWithPos};
use crate::Result;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::ops::Bound::{Included, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_FILE: &str = "meta.log";
const SNAPSHOT_FILE: &str = "meta.snapshot";

/// Upper bound of key plus value; the largest value is the bitmap of a
/// folder with `u32::MAX` slots.
const MAX_RECORD_SIZE: u64 = 1 << 30;

pub struct MetadataStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    table: BTreeMap<Vec<u8>, Vec<u8>>,
    log: BufWriterWithPos<File>,
}

impl MetadataStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<MetadataStore> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut table = BTreeMap::new();
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let snapshot = File::open(&snapshot_path)?;
            let snapshot_len = snapshot.metadata()?.len();
            let valid_len = Self::load_log(snapshot, &mut table)?;
            if valid_len != snapshot_len {
                return Err(SectorStoreError::InvalidLog(format!(
                    "corrupted metadata snapshot {:?}",
                    snapshot_path
                )));
            }
        }

        let log_path = dir.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&log_path)?;
        let log_len = log.metadata()?.len();
        let valid_len = Self::load_log(log.try_clone()?, &mut table)?;
        if valid_len < log_len {
            warn!(
                "truncate torn tail of {:?}: {} -> {} bytes",
                log_path, log_len, valid_len
            );
            log.set_len(valid_len)?;
            log.sync_all()?;
        }
        debug!("open metadata store {:?}, {} entries", dir, table.len());

        Ok(MetadataStore {
            dir,
            inner: Mutex::new(StoreInner {
                table,
                log: BufWriterWithPos::new(log)?,
            }),
        })
    }

    /// Load records into `table` and return the length of the valid prefix.
    fn load_log(file: File, table: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<u64> {
        let file_len = file.metadata()?.len();
        let mut reader = BufReaderWithPos::new(file)?;
        loop {
            let offset = reader.pos();
            let header = match read_bytes_exact(&mut reader, 12) {
                Ok(header) => header,
                Err(SectorStoreError::IOError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(offset)
                }
                Err(e) => return Err(e),
            };
            let checksum = u32_from_le_bytes(&header[..4]);
            let key_length = u32_from_le_bytes(&header[4..8]) as u64;
            let value_length = u32_from_le_bytes(&header[8..]) as u64;
            // a torn header must not size the buffer
            let body_length = key_length + value_length;
            if body_length > MAX_RECORD_SIZE || reader.pos() + body_length > file_len {
                return Ok(offset);
            }
            let body = match read_bytes_exact(&mut reader, body_length) {
                Ok(body) => body,
                Err(SectorStoreError::IOError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(offset)
                }
                Err(e) => return Err(e),
            };
            if checksum != record_checksum(&header[4..], &body) {
                return Ok(offset);
            }
            let (key, value) = body.split_at(key_length as usize);
            if value_length > 0 {
                table.insert(key.to_vec(), value.to_vec());
            } else {
                table.remove(key);
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().table.get(key).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().unwrap().table.contains_key(key)
    }

    /// Durably set `key` to a non-empty `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(SectorStoreError::Custom(String::from(
                "empty metadata value",
            )));
        }
        let mut guard = self.inner.lock().unwrap();
        guard.append(key, value)?;
        guard.table.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Durably remove `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if !guard.table.contains_key(key) {
            return Ok(());
        }
        guard.append(key, &[])?;
        guard.table.remove(key);
        Ok(())
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let guard = self.inner.lock().unwrap();
        guard
            .table
            .range::<[u8], _>((Included(prefix), Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the mutation log in bytes.
    pub fn log_len(&self) -> u64 {
        self.inner.lock().unwrap().log.pos
    }

    /// Write the whole table to a new snapshot and empty the log.
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let mut buf = vec![];
        for (k, v) in guard.table.iter() {
            encode_record(&mut buf, k, v);
        }

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&buf)?;
        temp.as_file().sync_all()?;
        temp.persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| e.error)?;
        sync_dir(&self.dir)?;

        // replaying the old log over the new snapshot is harmless, so a crash
        // before this point loses nothing
        let before = guard.log.pos;
        guard.log.truncate(0)?;
        guard.log.sync_data()?;
        debug!(
            "compact metadata store: log {} -> 0 bytes, snapshot {} bytes",
            before,
            buf.len()
        );
        Ok(())
    }
}

impl StoreInner {
    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(12 + key.len() + value.len());
        encode_record(&mut buf, key, value);
        let start = self.log.pos;
        let result = self.log.write_all(&buf).and_then(|_| self.log.sync_data());
        if let Err(e) = result {
            if let Err(e) = self.log.truncate(start) {
                error!("cannot cut off failed metadata write: {}", e);
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn encode_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    let mut lengths = [0u8; 8];
    lengths[..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    lengths[4..].copy_from_slice(&(value.len() as u32).to_le_bytes());
    let mut body = Vec::with_capacity(key.len() + value.len());
    body.extend_from_slice(key);
    body.extend_from_slice(value);

    buf.extend_from_slice(&record_checksum(&lengths, &body).to_le_bytes());
    buf.extend_from_slice(&lengths);
    buf.extend_from_slice(&body);
}

fn record_checksum(lengths: &[u8], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(lengths);
    hasher.update(body);
    hasher.finalize() ^ 0xFF
}
