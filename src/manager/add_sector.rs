use crate::disrupt::{PHYSICAL_PREPARE, PHYSICAL_PROCESS, VIRTUAL_PREPARE, VIRTUAL_PROCESS};
use crate::error::SectorStoreError;
use crate::hash::{MerkleRoot, SectorID};
use crate::index::SectorRecord;
use crate::manager::StorageManager;
use crate::wal::Update;
use crate::Result;

impl StorageManager {
    /// Store a sector. Content already stored only gains a reference.
    pub fn add_sector(&self, root: MerkleRoot, data: &[u8]) -> Result<()> {
        let _op = self.lifecycle.begin()?;
        if data.len() as u64 != self.options.sector_size {
            return Err(SectorStoreError::InvalidSectorSize {
                expected: self.options.sector_size,
                actual: data.len() as u64,
            });
        }
        let id = self.sector_id(&root);
        let _sector_guard = self.sector_locks.lock(id);
        match self.sectors.get(&id) {
            Some(record) => self.add_virtual_sector(id, record),
            None => self.add_physical_sector(id, data),
        }
    }

    pub fn read_sector(&self, root: MerkleRoot) -> Result<Vec<u8>> {
        let _op = self.lifecycle.begin()?;
        let id = self.sector_id(&root);
        // keeps the slot from being freed and reused under the read
        let _sector_guard = self.sector_locks.lock(id);
        let record = self
            .sectors
            .get(&id)
            .ok_or(SectorStoreError::SectorNotFound)?;
        let folder = self
            .folders
            .get(record.folder)
            .ok_or(SectorStoreError::FolderUnavailable(record.folder))?;
        folder.read_at(record.index)
    }

    fn add_physical_sector(&self, id: SectorID, data: &[u8]) -> Result<()> {
        let (folder, index) = self.folders.reserve_slot()?;
        let handle = match self.wal.new_transaction(vec![Update::PhysicalPrepare {
            id,
            folder: folder.id(),
            index,
        }]) {
            Ok(handle) => handle,
            Err(e) => {
                folder.cancel_reservation(index);
                return Err(e);
            }
        };

        let record = SectorRecord {
            folder: folder.id(),
            index,
            count: 1,
        };
        let result = self
            .disrupter
            .disrupt(PHYSICAL_PREPARE)
            .and_then(|_| folder.write_at(index, data))
            .and_then(|_| {
                self.wal.append(
                    &handle,
                    vec![Update::SectorProcess {
                        id,
                        folder: record.folder,
                        index,
                        count: record.count,
                    }],
                )
            })
            .and_then(|_| self.disrupter.disrupt(PHYSICAL_PROCESS));
        if let Err(e) = result {
            return Err(self.abort(handle, e, || folder.cancel_reservation(index)));
        }

        self.wal.commit(&handle)?;
        self.folders.set_used_slot(&folder, index)?;
        self.sectors.put(id, record)?;
        self.wal.release(handle)?;
        debug!(
            "add sector {} to slot {} of folder {}",
            id,
            index,
            folder.id()
        );
        Ok(())
    }

    fn add_virtual_sector(&self, id: SectorID, record: SectorRecord) -> Result<()> {
        let record = SectorRecord {
            count: record.count + 1,
            ..record
        };
        let handle = self
            .wal
            .new_transaction(vec![Update::VirtualPrepare { id }])?;
        let result = self
            .disrupter
            .disrupt(VIRTUAL_PREPARE)
            .and_then(|_| {
                self.wal.append(
                    &handle,
                    vec![Update::SectorProcess {
                        id,
                        folder: record.folder,
                        index: record.index,
                        count: record.count,
                    }],
                )
            })
            .and_then(|_| self.disrupter.disrupt(VIRTUAL_PROCESS));
        if let Err(e) = result {
            return Err(self.abort(handle, e, || {}));
        }

        self.wal.commit(&handle)?;
        self.sectors.put(id, record)?;
        self.wal.release(handle)?;
        debug!("add reference to sector {}, count {}", id, record.count);
        Ok(())
    }
}
