use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum SectorStoreError {
    #[error("{0}")]
    IOError(#[from] io::Error),

    #[error("storage manager is shutting down")]
    ShuttingDown,

    #[error("storage manager already shut down")]
    AlreadyShutDown,

    #[error("invalid storage folder path: {0:?}")]
    InvalidPath(PathBuf),

    #[error("insufficient space for a storage folder")]
    InsufficientSpace,

    #[error("no storage folder has a free sector slot")]
    NoSpaceAvailable,

    #[error("storage folder is full")]
    CapacityExhausted,

    #[error("sector not found")]
    SectorNotFound,

    #[error("storage folder {0} is unavailable")]
    FolderUnavailable(u16),

    #[error("fail to read sector")]
    ReadFailure,

    #[error("fail to write sector")]
    WriteFailure,

    #[error("invalid sector size: expect {expected}, got {actual}")]
    InvalidSectorSize { expected: u64, actual: u64 },

    #[error("cannot open write-ahead log: {0}")]
    WalOpen(String),

    #[error("write-ahead log is closed")]
    WalClosed,

    #[error("invalid log: {0}")]
    InvalidLog(String),

    #[error("disrupted at `{0}`")]
    Disrupted(String),

    #[error("crashed at `{0}`")]
    Crashed(String),

    #[error("{0}")]
    Custom(String),
}

impl PartialEq for SectorStoreError {
    fn eq(&self, other: &Self) -> bool {
        use SectorStoreError::*;
        match (self, other) {
            (IOError(e1), IOError(e2)) => e1.kind() == e2.kind(),
            (ShuttingDown, ShuttingDown)
            | (AlreadyShutDown, AlreadyShutDown)
            | (InsufficientSpace, InsufficientSpace)
            | (NoSpaceAvailable, NoSpaceAvailable)
            | (CapacityExhausted, CapacityExhausted)
            | (SectorNotFound, SectorNotFound)
            | (ReadFailure, ReadFailure)
            | (WriteFailure, WriteFailure)
            | (WalClosed, WalClosed) => true,
            (InvalidPath(p1), InvalidPath(p2)) => p1.eq(p2),
            (FolderUnavailable(f1), FolderUnavailable(f2)) => f1.eq(f2),
            (
                InvalidSectorSize {
                    expected: e1,
                    actual: a1,
                },
                InvalidSectorSize {
                    expected: e2,
                    actual: a2,
                },
            ) => e1 == e2 && a1 == a2,
            (WalOpen(s1), WalOpen(s2))
            | (InvalidLog(s1), InvalidLog(s2))
            | (Disrupted(s1), Disrupted(s2))
            | (Crashed(s1), Crashed(s2))
            | (Custom(s1), Custom(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}
