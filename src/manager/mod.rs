//! The storage manager ties the write-ahead log, the indexes, the storage
//! folders and the sector locks together.
//!
//! Every mutation follows the same discipline:
//!
//! 1. a prepare update opens a transaction;
//! 2. the work is done (content written, folder file created);
//! 3. a process update records the absolute metadata to commit;
//! 4. the commit marker is written, after which recovery redoes the
//!    transaction after any crash;
//! 5. the metadata store and the in-memory indexes are updated;
//! 6. the transaction is released.
//!
//! A failure before step 4 rolls back in process. A failure from step 4 on
//! leaves the transaction in the log for the next open.

mod add_folder;
mod add_sector;
mod lifecycle;
mod maintenance;
mod recovery;
mod remove_sector;

pub use lifecycle::State;

use crate::config::StorageOptions;
use crate::disrupt::Disrupter;
use crate::error::SectorStoreError;
use crate::folder::FolderID;
use crate::hash::{MerkleRoot, Salt, SectorID};
use crate::index::store::MetadataStore;
use crate::index::{check_sector_size, load_or_create_salt, FolderIndex, SectorIndex, SectorRecord};
use crate::lock::SectorLockTable;
use crate::wal::{TransactionHandle, WriteAheadLog, WAL_FILE_NAME};
use crate::Result;
use lifecycle::Lifecycle;
use maintenance::Maintenance;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const METADATA_DIR: &str = "metadata";

/// Usage of one storage folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFolder {
    pub id: FolderID,
    pub path: PathBuf,
    pub total_sectors: u64,
    pub used_sectors: u64,
    pub available: bool,
}

/// Space of all storage folders, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostSpace {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

pub struct StorageManager {
    options: StorageOptions,
    salt: Salt,
    store: Arc<MetadataStore>,
    wal: Arc<WriteAheadLog>,
    folders: FolderIndex,
    sectors: SectorIndex,
    sector_locks: SectorLockTable,
    /// Serializes folder creation.
    folder_lock: Mutex<()>,
    lifecycle: Lifecycle,
    disrupter: Disrupter,
    maintenance: Mutex<Option<Maintenance>>,
}

impl StorageManager {
    pub fn open(options: StorageOptions) -> Result<StorageManager> {
        StorageManager::open_with_disrupter(options, Disrupter::new())
    }

    /// Open the store, recovering from the write-ahead log.
    pub fn open_with_disrupter(
        options: StorageOptions,
        disrupter: Disrupter,
    ) -> Result<StorageManager> {
        if options.sector_size == 0 {
            return Err(SectorStoreError::Custom(String::from(
                "sector size must be positive",
            )));
        }
        std::fs::create_dir_all(&options.persist_dir)?;

        let store = Arc::new(MetadataStore::open(
            options.persist_dir.join(METADATA_DIR),
        )?);
        check_sector_size(&store, options.sector_size)?;
        let salt = load_or_create_salt(&store)?;

        let (wal, txns) = WriteAheadLog::open(options.persist_dir.join(WAL_FILE_NAME))
            .map_err(|e| SectorStoreError::WalOpen(e.to_string()))?;
        recovery::recover(&store, &txns)?;
        for txn in txns.iter() {
            wal.release(txn.handle())?;
        }
        wal.compact()?;
        let wal = Arc::new(wal);

        let folders = FolderIndex::load_all(store.clone(), options.sector_size)?;
        let sectors = SectorIndex::load_all(store.clone())?;
        info!(
            "open storage manager at {:?}: {} folders, {} sectors",
            options.persist_dir,
            folders.len(),
            sectors.len()
        );

        let maintenance = Maintenance::start(wal.clone(), store.clone(), &options)?;
        Ok(StorageManager {
            options,
            salt,
            store,
            wal,
            folders,
            sectors,
            sector_locks: SectorLockTable::new(),
            folder_lock: Mutex::new(()),
            lifecycle: Lifecycle::new(),
            disrupter,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn sector_id(&self, root: &MerkleRoot) -> SectorID {
        SectorID::derive(&self.salt, root)
    }

    /// Location and reference count of the sector with merkle root `root`.
    pub fn sector(&self, root: &MerkleRoot) -> Option<SectorRecord> {
        self.sectors.get(&self.sector_id(root))
    }

    pub fn folders(&self) -> Vec<HostFolder> {
        self.folders
            .all()
            .iter()
            .map(|folder| HostFolder {
                id: folder.id(),
                path: folder.path().to_path_buf(),
                total_sectors: folder.capacity() as u64,
                used_sectors: folder.used(),
                available: folder.is_available(),
            })
            .collect()
    }

    pub fn space(&self) -> HostSpace {
        let (total, used) = self
            .folders()
            .iter()
            .fold((0, 0), |(total, used), folder| {
                (total + folder.total_sectors, used + folder.used_sectors)
            });
        let sector_size = self.options.sector_size;
        HostSpace {
            total: total * sector_size,
            used: used * sector_size,
            free: (total - used) * sector_size,
        }
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Number of transactions not released yet.
    pub fn pending_transactions(&self) -> usize {
        self.wal.pending()
    }

    /// Stop accepting operations, wait for running ones and close the log.
    /// Only the first call does anything; later ones get `AlreadyShutDown`.
    pub fn close(&self) -> Result<()> {
        self.lifecycle.begin_close()?;
        info!("close storage manager at {:?}", self.options.persist_dir);

        if let Some(mut maintenance) = self.maintenance.lock().unwrap().take() {
            maintenance.stop();
        }
        self.lifecycle.wait_drained();

        let result = self.wal.close().map(|pending| {
            if pending > 0 {
                warn!(
                    "{} transactions left in the write-ahead log for the next open",
                    pending
                );
            }
            if let Err(e) = self.store.compact() {
                warn!("fail to compact metadata store on close: {}", e);
            }
        });
        self.lifecycle.set_closed();
        result
    }

    /// Roll back an operation that failed before its commit marker. A crash
    /// leaves everything as it is, for recovery to sort out.
    fn abort(
        &self,
        handle: TransactionHandle,
        err: SectorStoreError,
        rollback: impl FnOnce(),
    ) -> SectorStoreError {
        if let SectorStoreError::Crashed(_) = err {
            warn!("transaction {} left unfinished: {}", handle.id(), err);
            return err;
        }
        warn!("roll back transaction {}: {}", handle.id(), err);
        rollback();
        if let Err(e) = self.wal.release(handle) {
            error!("fail to release rolled back transaction: {}", e);
        }
        err
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if self.lifecycle.state() == State::Running {
            if let Err(e) = self.close() {
                error!("fail to close storage manager: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StorageOptions;
    use crate::error::SectorStoreError;
    use crate::index::load_folder_record;
    use crate::manager::{HostSpace, State, StorageManager};
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SECTOR_SIZE: u64 = 128;

    fn open(temp_dir: &TempDir) -> StorageManager {
        let options = StorageOptions::new(temp_dir.path().join("persist")).with_sector_size(SECTOR_SIZE);
        StorageManager::open(options).unwrap()
    }

    fn sector(seed: u8) -> ([u8; 32], Vec<u8>) {
        ([seed; 32], vec![seed; SECTOR_SIZE as usize])
    }

    /// The cached usage of each folder matches its bitmap, in memory and on disk.
    fn check_usage(manager: &StorageManager) {
        for folder in manager.folders.all() {
            let record = folder.record();
            assert_eq!(folder.used(), record.used());
            let durable = load_folder_record(&manager.store, folder.id())
                .unwrap()
                .unwrap();
            assert_eq!(record, durable);
        }
    }

    #[test]
    fn test_lifecycle() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let manager = open(&temp_dir);
        assert_eq!(State::Running, manager.state());
        assert_eq!(HostSpace::default(), manager.space());

        manager.close().unwrap();
        assert_eq!(State::Closed, manager.state());
        assert_eq!(SectorStoreError::AlreadyShutDown, manager.close().unwrap_err());
        let (root, data) = sector(1);
        assert_eq!(
            SectorStoreError::ShuttingDown,
            manager.add_sector(root, &data).unwrap_err()
        );
        assert_eq!(
            SectorStoreError::ShuttingDown,
            manager.read_sector(root).unwrap_err()
        );
        assert_eq!(
            SectorStoreError::AlreadyShutDown,
            manager
                .add_storage_folder(temp_dir.path().join("f"), SECTOR_SIZE)
                .unwrap_err()
        );
    }

    #[test]
    fn test_sector_size_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        drop(open(&temp_dir));
        let options = StorageOptions::new(temp_dir.path().join("persist")).with_sector_size(64);
        assert_eq!(
            SectorStoreError::InvalidSectorSize {
                expected: SECTOR_SIZE,
                actual: 64
            },
            StorageManager::open(options).err().unwrap()
        );
    }

    #[test]
    fn test_random_workload() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let manager = open(&temp_dir);
        manager
            .add_storage_folder(temp_dir.path().join("f0"), 10 * SECTOR_SIZE)
            .unwrap();
        manager
            .add_storage_folder(temp_dir.path().join("f1"), 70 * SECTOR_SIZE)
            .unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut counts: HashMap<u8, u64> = HashMap::new();
        for _ in 0..400 {
            let seed = rng.gen_range(0..60u8);
            let (root, data) = sector(seed);
            if rng.gen_bool(0.6) {
                manager.add_sector(root, &data).unwrap();
                *counts.entry(seed).or_insert(0) += 1;
            } else {
                match counts.get_mut(&seed) {
                    Some(count) => {
                        manager.remove_sector(root).unwrap();
                        *count -= 1;
                        if *count == 0 {
                            counts.remove(&seed);
                        }
                    }
                    None => assert_eq!(
                        SectorStoreError::SectorNotFound,
                        manager.remove_sector(root).unwrap_err()
                    ),
                }
            }
        }
        check_usage(&manager);
        assert_eq!(0, manager.pending_transactions());

        let used: u64 = manager.folders().iter().map(|f| f.used_sectors).sum();
        assert_eq!(counts.len() as u64, used);
        assert_eq!(used * SECTOR_SIZE, manager.space().used);
        for (seed, count) in counts.iter() {
            let (root, data) = sector(*seed);
            assert_eq!(*count, manager.sector(&root).unwrap().count);
            assert_eq!(data, manager.read_sector(root).unwrap());
        }
        manager.close().unwrap();
        drop(manager);

        let manager = open(&temp_dir);
        check_usage(&manager);
        for (seed, count) in counts.iter() {
            let (root, data) = sector(*seed);
            assert_eq!(*count, manager.sector(&root).unwrap().count);
            assert_eq!(data, manager.read_sector(root).unwrap());
        }
    }

    #[test]
    fn test_concurrent_same_sector() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let manager = Arc::new(open(&temp_dir));
        manager
            .add_storage_folder(temp_dir.path().join("f0"), 4 * SECTOR_SIZE)
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    let (root, data) = sector(9);
                    for _ in 0..10 {
                        manager.add_sector(root, &data).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let (root, _) = sector(9);
        assert_eq!(80, manager.sector(&root).unwrap().count);
        assert_eq!(1, manager.folders()[0].used_sectors);
        assert!(manager.sector_locks.is_empty());
        check_usage(&manager);
    }
}
