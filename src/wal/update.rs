//! Update records carried by write-ahead log transactions.
//!
//! "Prepare" updates describe an intent and are replayed as no-ops (or cleaned
//! up when the transaction was never committed). "Process" updates carry the
//! absolute metadata an operation commits, so re-executing them over a store
//! that already holds part of their effect is harmless.

use crate::error::SectorStoreError;
use crate::hash::{SectorID, HASH_SIZE};
use crate::ioutils::{read_bytes_exact, read_string_exact, read_u16, read_u32, read_u64, read_u8};
use crate::Result;
use std::io::{Cursor, Read};

const ADD_FOLDER_PREPARE: u8 = 1;
const ADD_FOLDER_PROCESS: u8 = 2;
const PHYSICAL_PREPARE: u8 = 3;
const VIRTUAL_PREPARE: u8 = 4;
const REMOVE_PREPARE: u8 = 5;
const SECTOR_PROCESS: u8 = 6;
const SECTOR_DELETE_PROCESS: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    AddFolderPrepare {
        id: u16,
        path: String,
        capacity: u32,
    },
    AddFolderProcess {
        id: u16,
        path: String,
        capacity: u32,
    },
    /// Slot `index` of `folder` is reserved for sector `id`.
    PhysicalPrepare {
        id: SectorID,
        folder: u16,
        index: u32,
    },
    VirtualPrepare {
        id: SectorID,
    },
    RemovePrepare {
        id: SectorID,
    },
    /// Sector `id` lives at `folder`/`index` with `count` references.
    SectorProcess {
        id: SectorID,
        folder: u16,
        index: u32,
        count: u64,
    },
    /// Sector `id` is gone and its slot is free.
    SectorDeleteProcess {
        id: SectorID,
        folder: u16,
        index: u32,
    },
}

impl Update {
    pub fn is_prepare(&self) -> bool {
        matches!(
            self,
            Update::AddFolderPrepare { .. }
                | Update::PhysicalPrepare { .. }
                | Update::VirtualPrepare { .. }
                | Update::RemovePrepare { .. }
        )
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Update::AddFolderPrepare { id, path, capacity } => {
                buf.push(ADD_FOLDER_PREPARE);
                encode_folder(buf, *id, path, *capacity);
            }
            Update::AddFolderProcess { id, path, capacity } => {
                buf.push(ADD_FOLDER_PROCESS);
                encode_folder(buf, *id, path, *capacity);
            }
            Update::PhysicalPrepare { id, folder, index } => {
                buf.push(PHYSICAL_PREPARE);
                buf.extend_from_slice(id.as_bytes());
                buf.extend_from_slice(&folder.to_le_bytes());
                buf.extend_from_slice(&index.to_le_bytes());
            }
            Update::VirtualPrepare { id } => {
                buf.push(VIRTUAL_PREPARE);
                buf.extend_from_slice(id.as_bytes());
            }
            Update::RemovePrepare { id } => {
                buf.push(REMOVE_PREPARE);
                buf.extend_from_slice(id.as_bytes());
            }
            Update::SectorProcess {
                id,
                folder,
                index,
                count,
            } => {
                buf.push(SECTOR_PROCESS);
                buf.extend_from_slice(id.as_bytes());
                buf.extend_from_slice(&folder.to_le_bytes());
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
            Update::SectorDeleteProcess { id, folder, index } => {
                buf.push(SECTOR_DELETE_PROCESS);
                buf.extend_from_slice(id.as_bytes());
                buf.extend_from_slice(&folder.to_le_bytes());
                buf.extend_from_slice(&index.to_le_bytes());
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Update> {
        let mut reader = Cursor::new(bytes);
        let update = match read_u8(&mut reader)? {
            ADD_FOLDER_PREPARE => {
                let (id, path, capacity) = decode_folder(&mut reader)?;
                Update::AddFolderPrepare { id, path, capacity }
            }
            ADD_FOLDER_PROCESS => {
                let (id, path, capacity) = decode_folder(&mut reader)?;
                Update::AddFolderProcess { id, path, capacity }
            }
            PHYSICAL_PREPARE => Update::PhysicalPrepare {
                id: read_sector_id(&mut reader)?,
                folder: read_u16(&mut reader)?,
                index: read_u32(&mut reader)?,
            },
            VIRTUAL_PREPARE => Update::VirtualPrepare {
                id: read_sector_id(&mut reader)?,
            },
            REMOVE_PREPARE => Update::RemovePrepare {
                id: read_sector_id(&mut reader)?,
            },
            SECTOR_PROCESS => Update::SectorProcess {
                id: read_sector_id(&mut reader)?,
                folder: read_u16(&mut reader)?,
                index: read_u32(&mut reader)?,
                count: read_u64(&mut reader)?,
            },
            SECTOR_DELETE_PROCESS => Update::SectorDeleteProcess {
                id: read_sector_id(&mut reader)?,
                folder: read_u16(&mut reader)?,
                index: read_u32(&mut reader)?,
            },
            tag => return Err(SectorStoreError::InvalidLog(format!("unknown update {}", tag))),
        };
        if reader.position() != bytes.len() as u64 {
            return Err(SectorStoreError::InvalidLog(String::from(
                "trailing bytes after update",
            )));
        }
        Ok(update)
    }
}

fn encode_folder(buf: &mut Vec<u8>, id: u16, path: &str, capacity: u32) {
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&capacity.to_le_bytes());
    buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
}

fn decode_folder(reader: &mut impl Read) -> Result<(u16, String, u32)> {
    let id = read_u16(reader)?;
    let capacity = read_u32(reader)?;
    let path_length = read_u32(reader)?;
    let path = read_string_exact(reader, path_length)?;
    Ok((id, path, capacity))
}

fn read_sector_id(reader: &mut impl Read) -> Result<SectorID> {
    let bytes = read_bytes_exact(reader, HASH_SIZE as u64)?;
    SectorID::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use crate::hash::{Salt, SectorID};
    use crate::wal::Update;

    #[test]
    fn test_decode_rejects_garbage() {
        let id = SectorID::derive(&Salt::generate(), &[3u8; 32]);
        let update = Update::SectorProcess {
            id,
            folder: 2,
            index: 17,
            count: 3,
        };
        let mut buf = vec![];
        update.encode(&mut buf);
        assert_eq!(update, Update::decode(&buf).unwrap());
        assert!(!update.is_prepare());

        assert!(Update::decode(&buf[..buf.len() - 1]).is_err());
        buf.push(0);
        assert!(Update::decode(&buf).is_err());
        assert!(Update::decode(&[0xee]).is_err());
        assert!(Update::decode(&[]).is_err());
    }

    #[test]
    fn test_folder_path() {
        let update = Update::AddFolderPrepare {
            id: 9,
            path: String::from("/tmp/中文/folder"),
            capacity: 64,
        };
        let mut buf = vec![];
        update.encode(&mut buf);
        assert_eq!(update, Update::decode(&buf).unwrap());
        assert!(update.is_prepare());
    }
}
