//! Write-ahead log of sector and folder mutations.
//!
//! ```text
//! +-------------------+
//! | length            | u32, length of `kind | txn | body`
//! +-------------------+
//! | checksum          | u32, crc32 of `kind | txn | body`
//! +-------------------+
//! | kind              | u8, UPDATE / COMMIT / RELEASE
//! +-------------------+
//! | txn               | u64
//! +-------------------+
//! | body              | variant length, an encoded `Update` for UPDATE
//! +-------------------+
//! ```
//!
//! A transaction is a run of UPDATE records followed by a COMMIT record once
//! the caller is ready to make it durable, and a RELEASE record once its
//! effects have been applied. Reopening the log yields every transaction that
//! was not released.
use crate::byteutils::u32_from_le_bytes;
use crate::error::SectorStoreError;
use crate::ioutils::{
    read_bytes_exact, read_u64, read_u8, sync_dir, BufReaderWithPos, BufWriterWithPos,
};
use crate::Result;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

mod update;

pub use update::Update;

pub const WAL_FILE_NAME: &str = "wal.log";

const UPDATE: u8 = 1;
const COMMIT: u8 = 2;
const RELEASE: u8 = 3;

const MAX_RECORD_SIZE: u32 = 1 << 20;

pub type TransactionID = u64;

/// A transaction that was not released when the log was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionID,
    pub updates: Vec<Update>,
    pub committed: bool,
}

impl Transaction {
    fn new(id: TransactionID) -> Transaction {
        Transaction {
            id,
            updates: vec![],
            committed: false,
        }
    }

    /// Take over a recovered transaction so it can be released.
    pub(crate) fn handle(&self) -> TransactionHandle {
        TransactionHandle { id: self.id }
    }
}

/// Proof of an open transaction. Releasing consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    id: TransactionID,
}

impl TransactionHandle {
    pub fn id(&self) -> TransactionID {
        self.id
    }
}

enum Record {
    Update(TransactionID, Update),
    Commit(TransactionID),
    Release(TransactionID),
}

pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WALInner>,
}

struct WALInner {
    writer: BufWriterWithPos<File>,
    next_txn: TransactionID,
    /// Transactions not released yet, in log order.
    pending: BTreeMap<TransactionID, Transaction>,
    closed: bool,
}

impl WriteAheadLog {
    /// Open the log at `path` and return the transactions that were not released.
    pub fn open(path: impl AsRef<Path>) -> Result<(WriteAheadLog, Vec<Transaction>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut pending: BTreeMap<TransactionID, Transaction> = BTreeMap::new();
        let mut max_txn = 0;
        let mut reader = BufReaderWithPos::new(file)?;
        let valid_len = loop {
            let offset = reader.pos();
            match read_record(&mut reader)? {
                Some(record) => match record {
                    Record::Update(txn, update) => {
                        max_txn = max_txn.max(txn);
                        pending
                            .entry(txn)
                            .or_insert_with(|| Transaction::new(txn))
                            .updates
                            .push(update);
                    }
                    Record::Commit(txn) => match pending.get_mut(&txn) {
                        Some(t) => t.committed = true,
                        None => warn!("commit of unknown transaction {}", txn),
                    },
                    Record::Release(txn) => {
                        pending.remove(&txn);
                    }
                },
                None => break offset,
            }
        };

        let file = reader.into_inner();
        if valid_len < file_len {
            warn!(
                "truncate torn tail of {:?}: {} -> {} bytes",
                path, file_len, valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let txns: Vec<Transaction> = pending.values().cloned().collect();
        info!(
            "open write-ahead log {:?}, {} incomplete transactions",
            path,
            txns.len()
        );
        let wal = WriteAheadLog {
            path,
            inner: Mutex::new(WALInner {
                writer: BufWriterWithPos::new(file)?,
                next_txn: max_txn + 1,
                pending,
                closed: false,
            }),
        };
        Ok((wal, txns))
    }

    /// Durably append `updates` as the beginning of a new transaction.
    pub fn new_transaction(&self, updates: Vec<Update>) -> Result<TransactionHandle> {
        let mut guard = self.inner.lock().unwrap();
        guard.check_open()?;
        let id = guard.next_txn;
        guard.next_txn += 1;

        let mut txn = Transaction::new(id);
        guard.write_updates(id, &updates)?;
        guard.writer.sync_data()?;
        txn.updates = updates;
        guard.pending.insert(id, txn);
        Ok(TransactionHandle { id })
    }

    /// Durably append `updates` to an uncommitted transaction.
    pub fn append(&self, handle: &TransactionHandle, updates: Vec<Update>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.check_open()?;
        match guard.pending.get(&handle.id) {
            Some(txn) if !txn.committed => {}
            _ => {
                return Err(SectorStoreError::Custom(format!(
                    "transaction {} is not open for updates",
                    handle.id
                )))
            }
        }
        guard.write_updates(handle.id, &updates)?;
        guard.writer.sync_data()?;
        if let Some(txn) = guard.pending.get_mut(&handle.id) {
            txn.updates.extend(updates);
        }
        Ok(())
    }

    /// Write the commit marker. Once this returns, recovery re-drives the
    /// transaction to completion.
    pub fn commit(&self, handle: &TransactionHandle) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.check_open()?;
        if !guard.pending.contains_key(&handle.id) {
            return Err(SectorStoreError::Custom(format!(
                "transaction {} is not pending",
                handle.id
            )));
        }
        guard.write_record(COMMIT, handle.id, &[])?;
        guard.writer.sync_data()?;
        if let Some(txn) = guard.pending.get_mut(&handle.id) {
            txn.committed = true;
        }
        Ok(())
    }

    /// Mark the transaction as applied. A lost release only causes an
    /// idempotent replay, so this does not sync.
    pub fn release(&self, handle: TransactionHandle) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.check_open()?;
        guard.write_record(RELEASE, handle.id, &[])?;
        guard.pending.remove(&handle.id);
        Ok(())
    }

    /// Number of transactions not released.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Current size of the log file in bytes.
    pub fn file_len(&self) -> u64 {
        self.inner.lock().unwrap().writer.pos
    }

    /// Rewrite the log so it only holds transactions that were not released.
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.check_open()?;
        self.compact_locked(&mut guard)
    }

    /// Compact, sync and refuse further writes. Returns the number of
    /// transactions left in the log.
    pub fn close(&self) -> Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        guard.check_open()?;
        self.compact_locked(&mut guard)?;
        guard.closed = true;
        Ok(guard.pending.len())
    }

    fn compact_locked(&self, inner: &mut WALInner) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let before = inner.writer.pos;

        let mut buf = vec![];
        for txn in inner.pending.values() {
            for update in &txn.updates {
                let mut body = vec![];
                update.encode(&mut body);
                encode_record(&mut buf, UPDATE, txn.id, &body);
            }
            if txn.committed {
                encode_record(&mut buf, COMMIT, txn.id, &[]);
            }
        }

        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(&buf)?;
        temp.as_file().sync_all()?;
        let file = temp.persist(&self.path).map_err(|e| e.error)?;
        sync_dir(&dir)?;
        inner.writer = BufWriterWithPos::new(file)?;
        debug!(
            "compact write-ahead log: {} -> {} bytes, {} transactions kept",
            before,
            inner.writer.pos,
            inner.pending.len()
        );
        Ok(())
    }
}

impl WALInner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(SectorStoreError::WalClosed)
        } else {
            Ok(())
        }
    }

    fn write_updates(&mut self, txn: TransactionID, updates: &[Update]) -> Result<()> {
        let mut buf = vec![];
        let mut body = vec![];
        for update in updates {
            body.clear();
            update.encode(&mut body);
            encode_record(&mut buf, UPDATE, txn, &body);
        }
        self.write_all(&buf)
    }

    fn write_record(&mut self, kind: u8, txn: TransactionID, body: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(17 + body.len());
        encode_record(&mut buf, kind, txn, body);
        self.write_all(&buf)
    }

    /// A failed write is cut off so later records never follow a torn one.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let start = self.writer.pos;
        if let Err(e) = self.writer.write_all(buf).and_then(|_| self.writer.flush()) {
            if let Err(e) = self.writer.truncate(start) {
                error!("cannot cut off failed write-ahead log write: {}", e);
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn encode_record(buf: &mut Vec<u8>, kind: u8, txn: TransactionID, body: &[u8]) {
    let length = (1 + 8 + body.len()) as u32;
    let start = buf.len();
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.push(kind);
    buf.extend_from_slice(&txn.to_le_bytes());
    buf.extend_from_slice(body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[start + 8..]);
    let checksum = hasher.finalize() ^ 0xFF;
    buf[start + 4..start + 8].copy_from_slice(&checksum.to_le_bytes());
}

/// `Ok(None)` marks the end of the usable log: end of file, a torn record or
/// a checksum mismatch.
fn read_record(reader: &mut BufReaderWithPos<File>) -> Result<Option<Record>> {
    let header = match read_bytes_exact(reader, 8) {
        Ok(header) => header,
        Err(SectorStoreError::IOError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };
    let length = u32_from_le_bytes(&header[..4]);
    let checksum = u32_from_le_bytes(&header[4..]);
    if length < 9 || length > MAX_RECORD_SIZE {
        return Ok(None);
    }
    let payload = match read_bytes_exact(reader, length as u64) {
        Ok(payload) => payload,
        Err(SectorStoreError::IOError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() ^ 0xFF != checksum {
        return Ok(None);
    }

    let mut cursor = std::io::Cursor::new(&payload[..]);
    let kind = read_u8(&mut cursor)?;
    let txn = read_u64(&mut cursor)?;
    let body = &payload[9..];
    let record = match kind {
        UPDATE => Record::Update(txn, Update::decode(body)?),
        COMMIT => Record::Commit(txn),
        RELEASE => Record::Release(txn),
        kind => {
            return Err(SectorStoreError::InvalidLog(format!(
                "unknown record kind {}",
                kind
            )))
        }
    };
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use crate::hash::{Salt, SectorID};
    use crate::wal::{Update, WriteAheadLog, WAL_FILE_NAME};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn updates(seed: u8) -> (Update, Update) {
        let id = SectorID::derive(&Salt::generate(), &[seed; 32]);
        (
            Update::PhysicalPrepare {
                id,
                folder: 1,
                index: seed as u32,
            },
            Update::SectorProcess {
                id,
                folder: 1,
                index: seed as u32,
                count: 1,
            },
        )
    }

    #[test]
    fn test_replay() {
        let _ = env_logger::try_init();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(WAL_FILE_NAME);

        let (wal, txns) = WriteAheadLog::open(&path).unwrap();
        assert!(txns.is_empty());

        // released
        let (prepare, process) = updates(1);
        let handle = wal.new_transaction(vec![prepare]).unwrap();
        wal.append(&handle, vec![process]).unwrap();
        wal.commit(&handle).unwrap();
        wal.release(handle).unwrap();

        // committed, never released
        let (prepare2, process2) = updates(2);
        let handle = wal.new_transaction(vec![prepare2.clone()]).unwrap();
        wal.append(&handle, vec![process2.clone()]).unwrap();
        wal.commit(&handle).unwrap();
        assert!(wal.append(&handle, vec![process2.clone()]).is_err());

        // prepared only
        let (prepare3, _) = updates(3);
        let handle3 = wal.new_transaction(vec![prepare3.clone()]).unwrap();
        assert_eq!(2, wal.pending());
        drop(wal);

        let (wal, txns) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(2, txns.len());
        assert!(txns[0].committed);
        assert_eq!(vec![prepare2, process2], txns[0].updates);
        assert!(!txns[1].committed);
        assert_eq!(vec![prepare3], txns[1].updates);
        assert!(handle3.id() == txns[1].id);

        // new ids never collide with recovered ones
        let handle = wal.new_transaction(vec![]).unwrap();
        assert!(handle.id() > txns[1].id);
        wal.release(handle).unwrap();

        for txn in txns.iter() {
            wal.release(txn.handle()).unwrap();
        }
        assert_eq!(0, wal.close().unwrap());
        assert!(wal.new_transaction(vec![]).is_err());

        let (_wal, txns) = WriteAheadLog::open(&path).unwrap();
        assert!(txns.is_empty());
    }

    #[test]
    fn test_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(WAL_FILE_NAME);
        let (wal, _) = WriteAheadLog::open(&path).unwrap();
        let (prepare, process) = updates(7);
        let handle = wal.new_transaction(vec![prepare]).unwrap();
        wal.append(&handle, vec![process]).unwrap();
        wal.commit(&handle).unwrap();
        let len = wal.file_len();
        drop(wal);

        // half a record left by a crash
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2, 3, 4, 1]).unwrap();
        drop(file);

        let (wal, txns) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(1, txns.len());
        assert!(txns[0].committed);
        assert_eq!(len, wal.file_len());
    }

    #[test]
    fn test_compact() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(WAL_FILE_NAME);
        let (wal, _) = WriteAheadLog::open(&path).unwrap();
        for i in 0..50 {
            let (prepare, process) = updates(i);
            let handle = wal.new_transaction(vec![prepare, process]).unwrap();
            wal.commit(&handle).unwrap();
            if i != 20 {
                wal.release(handle).unwrap();
            }
        }
        let before = wal.file_len();
        wal.compact().unwrap();
        assert!(wal.file_len() < before);
        assert_eq!(1, wal.pending());

        let (prepare, _) = updates(60);
        let handle = wal.new_transaction(vec![prepare]).unwrap();
        drop(handle);
        drop(wal);

        let (_wal, txns) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(2, txns.len());
        assert!(txns[0].committed);
        assert_eq!(2, txns[0].updates.len());
        assert!(!txns[1].committed);
    }
}
