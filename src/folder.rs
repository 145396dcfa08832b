//! Storage folders: fixed-capacity, file-backed containers of sector slots.
//!
//! ```text
//! <folder path>/sectors.dat
//! +----------+----------+-----+----------------+
//! | slot 0   | slot 1   | ... | slot cap - 1   |  each `sector_size` bytes
//! +----------+----------+-----+----------------+
//! ```
//!
//! Slot occupancy is tracked by a bitmap. A physical add first *reserves* a
//! slot, which hides it from other writers without making it used; the
//! reservation turns into a used bit only after the add is committed.
use crate::error::SectorStoreError;
use crate::ioutils::{read_string_exact, read_u16, read_u32, read_u64};
use crate::Result;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub const FOLDER_DATA_FILE: &str = "sectors.dat";

pub type FolderID = u16;

pub fn data_file_path(folder_path: &Path) -> PathBuf {
    folder_path.join(FOLDER_DATA_FILE)
}

/// Durable description of a storage folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub id: FolderID,
    pub path: String,
    pub capacity: u32,
    pub usage: Vec<u64>,
}

impl FolderRecord {
    pub fn new(id: FolderID, path: String, capacity: u32) -> FolderRecord {
        FolderRecord {
            id,
            path,
            capacity,
            usage: vec![0; bitmap_len(capacity)],
        }
    }

    pub fn used(&self) -> u64 {
        popcount(&self.usage)
    }

    pub fn is_used(&self, index: u32) -> bool {
        index < self.capacity && bit(&self.usage, index)
    }

    /// Returns `false` if the slot was already used.
    pub fn set_slot(&mut self, index: u32) -> bool {
        if bit(&self.usage, index) {
            return false;
        }
        self.usage[(index / 64) as usize] |= 1u64 << (index % 64);
        true
    }

    /// Returns `false` if the slot was already free.
    pub fn clear_slot(&mut self, index: u32) -> bool {
        if !bit(&self.usage, index) {
            return false;
        }
        self.usage[(index / 64) as usize] &= !(1u64 << (index % 64));
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14 + self.path.len() + self.usage.len() * 8);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        buf.extend_from_slice(&(self.path.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        for word in &self.usage {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<FolderRecord> {
        let mut reader = Cursor::new(bytes);
        let id = read_u16(&mut reader)?;
        let capacity = read_u32(&mut reader)?;
        let path_length = read_u32(&mut reader)?;
        let path = read_string_exact(&mut reader, path_length)?;
        let mut usage = Vec::with_capacity(bitmap_len(capacity));
        for _ in 0..bitmap_len(capacity) {
            usage.push(read_u64(&mut reader)?);
        }
        if reader.position() != bytes.len() as u64 {
            return Err(SectorStoreError::InvalidLog(format!(
                "folder record {} has trailing bytes",
                id
            )));
        }
        Ok(FolderRecord {
            id,
            path,
            capacity,
            usage,
        })
    }
}

struct FolderUsage {
    usage: Vec<u64>,
    used: u64,
    reserved: BTreeSet<u32>,
}

pub struct StorageFolder {
    id: FolderID,
    path: PathBuf,
    capacity: u32,
    sector_size: u64,
    data_file: Option<File>,
    state: Mutex<FolderUsage>,
    unavailable: AtomicBool,
}

impl StorageFolder {
    /// Create `path` if needed and preallocate its data file. An existing
    /// data file is never reused.
    pub fn create(
        id: FolderID,
        path: &Path,
        capacity: u32,
        sector_size: u64,
    ) -> Result<StorageFolder> {
        std::fs::create_dir_all(path)?;
        let file = match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(data_file_path(path))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SectorStoreError::InvalidPath(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        file.set_len(capacity as u64 * sector_size)?;
        file.sync_all()?;
        debug!(
            "create storage folder {} at {:?}, {} sectors",
            id, path, capacity
        );

        Ok(StorageFolder {
            id,
            path: path.to_path_buf(),
            capacity,
            sector_size,
            data_file: Some(file),
            state: Mutex::new(FolderUsage {
                usage: vec![0; bitmap_len(capacity)],
                used: 0,
                reserved: BTreeSet::new(),
            }),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Reopen a folder. A folder whose data file cannot be opened is loaded
    /// as unavailable.
    pub fn load(record: FolderRecord, sector_size: u64) -> StorageFolder {
        let path = PathBuf::from(&record.path);
        let data_file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_file_path(&path))
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(
                    "storage folder {} at {:?} is unavailable: {}",
                    record.id, path, e
                );
                None
            }
        };
        let used = popcount(&record.usage);
        StorageFolder {
            id: record.id,
            unavailable: AtomicBool::new(data_file.is_none()),
            path,
            capacity: record.capacity,
            sector_size,
            data_file,
            state: Mutex::new(FolderUsage {
                usage: record.usage,
                used,
                reserved: BTreeSet::new(),
            }),
        }
    }

    pub fn id(&self) -> FolderID {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.state.lock().unwrap().used
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::Acquire)
    }

    pub fn mark_unavailable(&self) {
        if !self.unavailable.swap(true, Ordering::AcqRel) {
            warn!("storage folder {} at {:?} marked unavailable", self.id, self.path);
        }
    }

    /// Snapshot of the committed occupancy.
    pub fn record(&self) -> FolderRecord {
        let state = self.state.lock().unwrap();
        self.record_of(&state)
    }

    fn record_of(&self, state: &FolderUsage) -> FolderRecord {
        FolderRecord {
            id: self.id,
            path: self.path.to_string_lossy().into_owned(),
            capacity: self.capacity,
            usage: state.usage.clone(),
        }
    }

    /// First free slot that is neither used nor reserved.
    pub fn reserve_slot(&self) -> Result<u32> {
        if !self.is_available() {
            return Err(SectorStoreError::FolderUnavailable(self.id));
        }
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.used + state.reserved.len() as u64 >= self.capacity as u64 {
            return Err(SectorStoreError::CapacityExhausted);
        }
        for (i, word) in state.usage.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            for offset in 0..64 {
                let index = i as u32 * 64 + offset;
                if index >= self.capacity {
                    break;
                }
                if word & (1u64 << offset) == 0 && !state.reserved.contains(&index) {
                    state.reserved.insert(index);
                    return Ok(index);
                }
            }
        }
        Err(SectorStoreError::CapacityExhausted)
    }

    pub fn cancel_reservation(&self, index: u32) {
        self.state.lock().unwrap().reserved.remove(&index);
    }

    /// Turn slot `index` into a used slot, passing the resulting occupancy to
    /// `persist` while the folder is still locked so durable snapshots are
    /// written in the same order as the in-memory changes.
    pub fn set_used_slot(
        &self,
        index: u32,
        persist: impl FnOnce(&FolderRecord) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.lock_state();
        self.check_index(index)?;
        if bit(&state.usage, index) {
            return Err(SectorStoreError::Custom(format!(
                "slot {} of folder {} is already used",
                index, self.id
            )));
        }
        state.reserved.remove(&index);
        state.usage[(index / 64) as usize] |= 1u64 << (index % 64);
        state.used += 1;
        persist(&self.record_of(&state))
    }

    /// Free slot `index`, see `set_used_slot` for `persist`.
    pub fn release_slot(
        &self,
        index: u32,
        persist: impl FnOnce(&FolderRecord) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.lock_state();
        self.check_index(index)?;
        if bit(&state.usage, index) {
            state.usage[(index / 64) as usize] &= !(1u64 << (index % 64));
            state.used -= 1;
        } else {
            warn!("release free slot {} of folder {}", index, self.id);
        }
        persist(&self.record_of(&state))
    }

    pub fn write_at(&self, index: u32, data: &[u8]) -> Result<()> {
        self.check_index(index)?;
        let file = self.available_file()?;
        let result = file
            .write_all_at(data, index as u64 * self.sector_size)
            .and_then(|_| file.sync_data());
        if let Err(e) = result {
            error!(
                "fail to write slot {} of folder {} at {:?}: {}",
                index, self.id, self.path, e
            );
            self.mark_unavailable();
            return Err(SectorStoreError::WriteFailure);
        }
        Ok(())
    }

    pub fn read_at(&self, index: u32) -> Result<Vec<u8>> {
        self.check_index(index)?;
        let file = self.available_file()?;
        let mut buf = vec![0u8; self.sector_size as usize];
        if let Err(e) = file.read_exact_at(&mut buf, index as u64 * self.sector_size) {
            error!(
                "fail to read slot {} of folder {} at {:?}: {}",
                index, self.id, self.path, e
            );
            if e.kind() != ErrorKind::Interrupted {
                self.mark_unavailable();
            }
            return Err(SectorStoreError::ReadFailure);
        }
        Ok(buf)
    }

    fn available_file(&self) -> Result<&File> {
        match &self.data_file {
            Some(file) if self.is_available() => Ok(file),
            _ => Err(SectorStoreError::FolderUnavailable(self.id)),
        }
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.capacity {
            return Err(SectorStoreError::Custom(format!(
                "slot {} out of folder {} with {} slots",
                index, self.id, self.capacity
            )));
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, FolderUsage> {
        self.state.lock().unwrap()
    }
}

/// Remove a data file left by a folder creation that never committed.
pub fn remove_data_file(folder_path: &Path) -> Result<()> {
    match std::fs::remove_file(data_file_path(folder_path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[inline]
fn bitmap_len(capacity: u32) -> usize {
    (capacity as usize + 63) / 64
}

#[inline]
fn bit(usage: &[u64], index: u32) -> bool {
    usage
        .get((index / 64) as usize)
        .map_or(false, |word| word & (1u64 << (index % 64)) != 0)
}

fn popcount(usage: &[u64]) -> u64 {
    usage.iter().map(|word| word.count_ones() as u64).sum()
}
