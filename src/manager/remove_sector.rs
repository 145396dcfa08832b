use crate::disrupt::{REMOVE_PREPARE, REMOVE_PROCESS};
use crate::error::SectorStoreError;
use crate::hash::MerkleRoot;
use crate::index::SectorRecord;
use crate::manager::StorageManager;
use crate::wal::Update;
use crate::Result;

impl StorageManager {
    /// Drop one reference to a sector, freeing its slot with the last one.
    pub fn remove_sector(&self, root: MerkleRoot) -> Result<()> {
        let _op = self.lifecycle.begin()?;
        let id = self.sector_id(&root);
        let _sector_guard = self.sector_locks.lock(id);
        let record = self
            .sectors
            .get(&id)
            .ok_or(SectorStoreError::SectorNotFound)?;

        let remaining = SectorRecord {
            count: record.count - 1,
            ..record
        };
        let process = if remaining.count > 0 {
            Update::SectorProcess {
                id,
                folder: record.folder,
                index: record.index,
                count: remaining.count,
            }
        } else {
            Update::SectorDeleteProcess {
                id,
                folder: record.folder,
                index: record.index,
            }
        };

        let handle = self
            .wal
            .new_transaction(vec![Update::RemovePrepare { id }])?;
        let result = self
            .disrupter
            .disrupt(REMOVE_PREPARE)
            .and_then(|_| self.wal.append(&handle, vec![process]))
            .and_then(|_| self.disrupter.disrupt(REMOVE_PROCESS));
        if let Err(e) = result {
            return Err(self.abort(handle, e, || {}));
        }

        self.wal.commit(&handle)?;
        if remaining.count > 0 {
            self.sectors.put(id, remaining)?;
        } else {
            self.sectors.delete(&id)?;
            match self.folders.get(record.folder) {
                Some(folder) => self.folders.release_slot(&folder, record.index)?,
                None => warn!(
                    "sector {} points to unknown storage folder {}",
                    id, record.folder
                ),
            }
        }
        self.wal.release(handle)?;
        debug!("remove reference to sector {}, count {}", id, remaining.count);
        Ok(())
    }
}
