use crate::disrupt::{FOLDER_PREPARE, FOLDER_PROCESS};
use crate::error::SectorStoreError;
use crate::folder::{data_file_path, remove_data_file, StorageFolder};
use crate::manager::StorageManager;
use crate::wal::Update;
use crate::Result;
use std::convert::TryFrom;
use std::path::Path;
use std::sync::Arc;

impl StorageManager {
    /// Register a new storage folder at the absolute `path`, holding as many
    /// sectors as fit in `size` bytes.
    pub fn add_storage_folder(&self, path: impl AsRef<Path>, size: u64) -> Result<()> {
        let _op = self
            .lifecycle
            .begin()
            .map_err(|_| SectorStoreError::AlreadyShutDown)?;
        let requested = path.as_ref();
        let _folder_guard = self.folder_lock.lock().unwrap();

        if !requested.is_absolute() {
            return Err(SectorStoreError::InvalidPath(requested.to_path_buf()));
        }
        let capacity = size / self.options.sector_size;
        if capacity == 0 || capacity > self.options.max_sectors_per_folder {
            return Err(SectorStoreError::InsufficientSpace);
        }
        let capacity = u32::try_from(capacity).map_err(|_| SectorStoreError::InsufficientSpace)?;

        // `..`, symlinks and bind mounts may all name a registered folder
        std::fs::create_dir_all(requested)?;
        let path = std::fs::canonicalize(requested)?;
        if self.folders.contains_path(&path) || data_file_path(&path).exists() {
            return Err(SectorStoreError::InvalidPath(requested.to_path_buf()));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| SectorStoreError::InvalidPath(requested.to_path_buf()))?
            .to_owned();
        let id = self
            .folders
            .next_id()
            .ok_or(SectorStoreError::InsufficientSpace)?;

        let handle = self.wal.new_transaction(vec![Update::AddFolderPrepare {
            id,
            path: path_str.clone(),
            capacity,
        }])?;
        let mut file_created = false;
        let created = self
            .disrupter
            .disrupt(FOLDER_PREPARE)
            .and_then(|_| StorageFolder::create(id, &path, capacity, self.options.sector_size))
            .and_then(|folder| {
                file_created = true;
                self.wal.append(
                    &handle,
                    vec![Update::AddFolderProcess {
                        id,
                        path: path_str,
                        capacity,
                    }],
                )?;
                self.disrupter.disrupt(FOLDER_PROCESS)?;
                Ok(folder)
            });
        let folder = match created {
            Ok(folder) => folder,
            Err(e) => {
                return Err(self.abort(handle, e, || {
                    if !file_created {
                        return;
                    }
                    if let Err(e) = remove_data_file(&path) {
                        error!("fail to remove data file of folder {}: {}", id, e);
                    }
                }))
            }
        };

        self.wal.commit(&handle)?;
        self.folders.put(Arc::new(folder))?;
        self.wal.release(handle)?;
        info!(
            "add storage folder {} at {:?}, {} sectors",
            id, path, capacity
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StorageOptions;
    use crate::disrupt::{Disrupter, Disruption, FOLDER_PREPARE, FOLDER_PROCESS};
    use crate::error::SectorStoreError;
    use crate::folder::data_file_path;
    use crate::manager::StorageManager;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const SECTOR_SIZE: u64 = 256;

    fn options(temp_dir: &TempDir) -> StorageOptions {
        StorageOptions::new(temp_dir.path().join("persist"))
            .with_sector_size(SECTOR_SIZE)
            .with_max_sectors_per_folder(16)
    }

    #[test]
    fn test_add_folder() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let manager = StorageManager::open(options(&temp_dir)).unwrap();
        let path = temp_dir.path().join("f0");

        manager
            .add_storage_folder(&path, 3 * SECTOR_SIZE + 10)
            .unwrap();
        let folders = manager.folders();
        assert_eq!(1, folders.len());
        assert_eq!(path.canonicalize().unwrap(), folders[0].path);
        assert_eq!(3, folders[0].total_sectors);
        assert_eq!(
            3 * SECTOR_SIZE,
            std::fs::metadata(data_file_path(&path)).unwrap().len()
        );

        assert_eq!(
            SectorStoreError::InvalidPath(path.clone()),
            manager.add_storage_folder(&path, SECTOR_SIZE).unwrap_err()
        );
        assert_eq!(
            SectorStoreError::InvalidPath(PathBuf::from("relative")),
            manager.add_storage_folder("relative", SECTOR_SIZE).unwrap_err()
        );
        assert_eq!(
            SectorStoreError::InsufficientSpace,
            manager
                .add_storage_folder(temp_dir.path().join("small"), SECTOR_SIZE - 1)
                .unwrap_err()
        );
        assert_eq!(
            SectorStoreError::InsufficientSpace,
            manager
                .add_storage_folder(temp_dir.path().join("large"), 17 * SECTOR_SIZE)
                .unwrap_err()
        );
        assert_eq!(1, manager.folders().len());
        assert_eq!(0, manager.pending_transactions());
    }

    #[test]
    fn test_add_folder_alias() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let manager = StorageManager::open(options(&temp_dir)).unwrap();
        let path = temp_dir.path().join("f0");
        let data = [7u8; SECTOR_SIZE as usize];
        manager.add_storage_folder(&path, 4 * SECTOR_SIZE).unwrap();
        manager.add_sector([7; 32], &data).unwrap();

        let dotted = path.join("..").join("f0");
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&path, &link).unwrap();
        for alias in [dotted, link].iter() {
            assert_eq!(
                SectorStoreError::InvalidPath(alias.clone()),
                manager.add_storage_folder(alias, 4 * SECTOR_SIZE).unwrap_err()
            );
        }

        // a data file this store does not know about is left alone
        let foreign = temp_dir.path().join("foreign");
        std::fs::create_dir_all(&foreign).unwrap();
        std::fs::write(data_file_path(&foreign), b"foreign").unwrap();
        assert_eq!(
            SectorStoreError::InvalidPath(foreign.clone()),
            manager
                .add_storage_folder(&foreign, 4 * SECTOR_SIZE)
                .unwrap_err()
        );
        assert_eq!(
            b"foreign".to_vec(),
            std::fs::read(data_file_path(&foreign)).unwrap()
        );

        assert_eq!(1, manager.folders().len());
        assert_eq!(0, manager.pending_transactions());
        assert_eq!(data.to_vec(), manager.read_sector([7; 32]).unwrap());
        assert_eq!(
            4 * SECTOR_SIZE,
            std::fs::metadata(data_file_path(&path)).unwrap().len()
        );
        drop(manager);

        let manager = StorageManager::open(options(&temp_dir)).unwrap();
        assert_eq!(1, manager.folders().len());
        assert_eq!(data.to_vec(), manager.read_sector([7; 32]).unwrap());
    }

    #[test]
    fn test_add_folder_disrupted() {
        let _ = env_logger::try_init();
        for &keyword in [FOLDER_PREPARE, FOLDER_PROCESS].iter() {
            for &disruption in [Disruption::Fail, Disruption::Crash].iter() {
                let temp_dir = TempDir::new().unwrap();
                let path = temp_dir.path().join("f0");
                let disrupter = Disrupter::new().register(keyword, disruption);
                let manager =
                    StorageManager::open_with_disrupter(options(&temp_dir), disrupter).unwrap();

                let err = manager
                    .add_storage_folder(&path, 4 * SECTOR_SIZE)
                    .unwrap_err();
                match disruption {
                    Disruption::Fail => {
                        assert_eq!(SectorStoreError::Disrupted(keyword.to_string()), err);
                        assert_eq!(0, manager.pending_transactions());
                        assert!(!data_file_path(&path).exists());
                    }
                    Disruption::Crash => {
                        assert_eq!(SectorStoreError::Crashed(keyword.to_string()), err);
                        assert_eq!(1, manager.pending_transactions());
                    }
                }
                assert!(manager.folders().is_empty());
                drop(manager);

                let manager = StorageManager::open(options(&temp_dir)).unwrap();
                assert!(manager.folders().is_empty());
                assert!(!data_file_path(&path).exists());
                assert_eq!(0, manager.pending_transactions());

                // the path can be used again
                manager.add_storage_folder(&path, 4 * SECTOR_SIZE).unwrap();
                assert_eq!(1, manager.folders().len());
            }
        }
    }
}
