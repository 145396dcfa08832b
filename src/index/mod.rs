//! In-memory folder and sector indexes, mirrored in the metadata store.
//!
//! The durable copy is written first; the in-memory maps change only after
//! the write-ahead log transaction carrying the change is committed.

pub mod store;

use crate::error::SectorStoreError;
use crate::folder::{FolderID, FolderRecord, StorageFolder};
use crate::hash::{Salt, SectorID, HASH_SIZE};
use crate::ioutils::{read_u16, read_u32, read_u64};
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, RwLock};
use store::MetadataStore;

const SECTOR_PREFIX: &[u8] = b"sector/";
const FOLDER_PREFIX: &[u8] = b"folder/";
const SALT_KEY: &[u8] = b"salt";
const SECTOR_SIZE_KEY: &[u8] = b"sector_size";

pub(crate) fn sector_key(id: &SectorID) -> Vec<u8> {
    let mut key = Vec::with_capacity(SECTOR_PREFIX.len() + HASH_SIZE);
    key.extend_from_slice(SECTOR_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

pub(crate) fn folder_key(id: FolderID) -> Vec<u8> {
    let mut key = Vec::with_capacity(FOLDER_PREFIX.len() + 2);
    key.extend_from_slice(FOLDER_PREFIX);
    // big endian keeps folders in id order
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Load the salt of the store, generating it on first use.
pub fn load_or_create_salt(store: &MetadataStore) -> Result<Salt> {
    match store.get(SALT_KEY) {
        Some(bytes) => Salt::from_bytes(&bytes),
        None => {
            let salt = Salt::generate();
            store.put(SALT_KEY, salt.as_bytes())?;
            info!("generate sector salt");
            Ok(salt)
        }
    }
}

/// Pin the sector size of the store on first use; reopening with another
/// size would misplace every slot.
pub fn check_sector_size(store: &MetadataStore, sector_size: u64) -> Result<()> {
    match store.get(SECTOR_SIZE_KEY) {
        Some(bytes) => {
            let mut reader = Cursor::new(&bytes[..]);
            let expected = read_u64(&mut reader)?;
            if expected != sector_size {
                return Err(SectorStoreError::InvalidSectorSize {
                    expected,
                    actual: sector_size,
                });
            }
            Ok(())
        }
        None => store.put(SECTOR_SIZE_KEY, &sector_size.to_le_bytes()),
    }
}

/// Location and reference count of a stored sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRecord {
    pub folder: FolderID,
    pub index: u32,
    pub count: u64,
}

impl SectorRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14);
        buf.extend_from_slice(&self.folder.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<SectorRecord> {
        if bytes.len() != 14 {
            return Err(SectorStoreError::InvalidLog(format!(
                "sector record of {} bytes",
                bytes.len()
            )));
        }
        let mut reader = Cursor::new(bytes);
        let record = SectorRecord {
            folder: read_u16(&mut reader)?,
            index: read_u32(&mut reader)?,
            count: read_u64(&mut reader)?,
        };
        if record.count == 0 {
            return Err(SectorStoreError::InvalidLog(format!(
                "sector record at slot {} of folder {} has no references",
                record.index, record.folder
            )));
        }
        Ok(record)
    }
}

pub(crate) fn load_sector_record(
    store: &MetadataStore,
    id: &SectorID,
) -> Result<Option<SectorRecord>> {
    store
        .get(&sector_key(id))
        .map(|bytes| SectorRecord::decode(&bytes))
        .transpose()
}

pub(crate) fn load_folder_record(
    store: &MetadataStore,
    id: FolderID,
) -> Result<Option<FolderRecord>> {
    store
        .get(&folder_key(id))
        .map(|bytes| FolderRecord::decode(&bytes))
        .transpose()
}

pub struct SectorIndex {
    sectors: RwLock<HashMap<SectorID, SectorRecord>>,
    store: Arc<MetadataStore>,
}

impl SectorIndex {
    pub fn load_all(store: Arc<MetadataStore>) -> Result<SectorIndex> {
        let mut sectors = HashMap::new();
        for (key, value) in store.scan_prefix(SECTOR_PREFIX) {
            let id = SectorID::from_bytes(&key[SECTOR_PREFIX.len()..])?;
            sectors.insert(id, SectorRecord::decode(&value)?);
        }
        Ok(SectorIndex {
            sectors: RwLock::new(sectors),
            store,
        })
    }

    pub fn get(&self, id: &SectorID) -> Option<SectorRecord> {
        self.sectors.read().unwrap().get(id).copied()
    }

    pub fn put(&self, id: SectorID, record: SectorRecord) -> Result<()> {
        self.store.put(&sector_key(&id), &record.encode())?;
        self.sectors.write().unwrap().insert(id, record);
        Ok(())
    }

    pub fn delete(&self, id: &SectorID) -> Result<()> {
        self.store.delete(&sector_key(id))?;
        self.sectors.write().unwrap().remove(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sectors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The durable copy of the record of `id`.
    pub fn persisted(&self, id: &SectorID) -> Result<Option<SectorRecord>> {
        load_sector_record(&self.store, id)
    }
}

pub struct FolderIndex {
    folders: RwLock<BTreeMap<FolderID, Arc<StorageFolder>>>,
    store: Arc<MetadataStore>,
}

impl FolderIndex {
    pub fn load_all(store: Arc<MetadataStore>, sector_size: u64) -> Result<FolderIndex> {
        let mut folders = BTreeMap::new();
        for (_, value) in store.scan_prefix(FOLDER_PREFIX) {
            let record = FolderRecord::decode(&value)?;
            let folder = StorageFolder::load(record, sector_size);
            folders.insert(folder.id(), Arc::new(folder));
        }
        Ok(FolderIndex {
            folders: RwLock::new(folders),
            store,
        })
    }

    pub fn get(&self, id: FolderID) -> Option<Arc<StorageFolder>> {
        self.folders.read().unwrap().get(&id).cloned()
    }

    /// Register a newly created folder.
    pub fn put(&self, folder: Arc<StorageFolder>) -> Result<()> {
        self.store
            .put(&folder_key(folder.id()), &folder.record().encode())?;
        self.folders.write().unwrap().insert(folder.id(), folder);
        Ok(())
    }

    pub fn all(&self) -> Vec<Arc<StorageFolder>> {
        self.folders.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.folders.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest folder id not in use.
    pub fn next_id(&self) -> Option<FolderID> {
        let folders = self.folders.read().unwrap();
        (0..=FolderID::MAX).find(|id| !folders.contains_key(id))
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.folders
            .read()
            .unwrap()
            .values()
            .any(|folder| folder.path() == path)
    }

    /// Reserve a slot in the first folder that has one.
    pub fn reserve_slot(&self) -> Result<(Arc<StorageFolder>, u32)> {
        for folder in self.all() {
            match folder.reserve_slot() {
                Ok(index) => return Ok((folder, index)),
                Err(SectorStoreError::CapacityExhausted)
                | Err(SectorStoreError::FolderUnavailable(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SectorStoreError::NoSpaceAvailable)
    }

    /// Mark a reserved slot used, in memory and in the store.
    pub fn set_used_slot(&self, folder: &StorageFolder, index: u32) -> Result<()> {
        folder.set_used_slot(index, |record| {
            self.store.put(&folder_key(record.id), &record.encode())
        })
    }

    pub fn release_slot(&self, folder: &StorageFolder, index: u32) -> Result<()> {
        folder.release_slot(index, |record| {
            self.store.put(&folder_key(record.id), &record.encode())
        })
    }
}
