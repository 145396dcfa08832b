//! Startup replay of the write-ahead log against the metadata store.
//!
//! Runs before the indexes are loaded. A committed transaction is redone from
//! its process updates, which carry absolute state. A transaction that never
//! committed touched no durable index state and is discarded, apart from the
//! data file a folder creation may have left behind.

use crate::error::SectorStoreError;
use crate::folder::{remove_data_file, FolderID, FolderRecord};
use crate::index::store::MetadataStore;
use crate::index::{folder_key, load_folder_record, sector_key, SectorRecord};
use crate::wal::{Transaction, Update};
use crate::Result;
use std::path::Path;

pub(crate) fn recover(store: &MetadataStore, txns: &[Transaction]) -> Result<()> {
    let (mut redone, mut discarded) = (0, 0);
    for txn in txns {
        if txn.committed {
            for update in &txn.updates {
                redo(store, update)?;
            }
            redone += 1;
        } else {
            for update in &txn.updates {
                discard(store, update)?;
            }
            warn!(
                "discard uncommitted transaction {} of {} updates",
                txn.id,
                txn.updates.len()
            );
            discarded += 1;
        }
    }
    if redone + discarded > 0 {
        info!(
            "recover: {} transactions redone, {} discarded",
            redone, discarded
        );
    }
    Ok(())
}

fn redo(store: &MetadataStore, update: &Update) -> Result<()> {
    match update {
        Update::AddFolderProcess { id, path, capacity } => {
            if load_folder_record(store, *id)?.is_none() {
                let record = FolderRecord::new(*id, path.clone(), *capacity);
                store.put(&folder_key(*id), &record.encode())?;
                debug!("redo: add storage folder {} at {}", id, path);
            }
        }
        Update::SectorProcess {
            id,
            folder,
            index,
            count,
        } => {
            let record = SectorRecord {
                folder: *folder,
                index: *index,
                count: *count,
            };
            store.put(&sector_key(id), &record.encode())?;
            update_slot(store, *folder, *index, true)?;
            debug!("redo: sector {} -> {:?}", id, record);
        }
        Update::SectorDeleteProcess { id, folder, index } => {
            store.delete(&sector_key(id))?;
            update_slot(store, *folder, *index, false)?;
            debug!("redo: delete sector {}", id);
        }
        Update::AddFolderPrepare { .. }
        | Update::PhysicalPrepare { .. }
        | Update::VirtualPrepare { .. }
        | Update::RemovePrepare { .. } => {}
    }
    Ok(())
}

fn discard(store: &MetadataStore, update: &Update) -> Result<()> {
    if let Update::AddFolderPrepare { id, path, .. } = update {
        let registered = match load_folder_record(store, *id)? {
            Some(record) => &record.path == path,
            None => false,
        };
        if !registered {
            remove_data_file(Path::new(path))?;
            debug!("discard: remove data file of folder {} at {}", id, path);
        }
    }
    Ok(())
}

fn update_slot(store: &MetadataStore, folder: FolderID, index: u32, used: bool) -> Result<()> {
    let mut record = match load_folder_record(store, folder)? {
        Some(record) => record,
        None => {
            warn!("redo on unknown storage folder {}", folder);
            return Ok(());
        }
    };
    if index >= record.capacity {
        return Err(SectorStoreError::InvalidLog(format!(
            "slot {} out of folder {} with {} slots",
            index, folder, record.capacity
        )));
    }
    let changed = if used {
        record.set_slot(index)
    } else {
        record.clear_slot(index)
    };
    if changed {
        store.put(&folder_key(folder), &record.encode())?;
    }
    Ok(())
}
