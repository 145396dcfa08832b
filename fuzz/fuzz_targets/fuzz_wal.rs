#![no_main]

use libfuzzer_sys::fuzz_target;
use sectorlite::wal::{WriteAheadLog, WAL_FILE_NAME};

fuzz_target!(|data: &[u8]| {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join(WAL_FILE_NAME);
    std::fs::write(&path, data).unwrap();

    // garbage is either cut off or rejected, never a panic
    let (wal, txns) = match WriteAheadLog::open(&path) {
        Ok(opened) => opened,
        Err(_) => return,
    };
    assert!(wal.file_len() <= data.len() as u64);
    assert_eq!(txns.len(), wal.pending());

    wal.compact().unwrap();
    drop(wal);
    let (_wal, reopened) = WriteAheadLog::open(&path).unwrap();
    assert_eq!(txns, reopened);
});
