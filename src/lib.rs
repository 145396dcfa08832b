#[macro_use]
extern crate log;

pub use manager::StorageManager;

mod byteutils;
pub mod config;
pub mod disrupt;
pub mod error;
pub mod folder;
pub mod hash;
pub mod index;
mod ioutils;
pub mod lock;
pub mod manager;
pub mod wal;

pub type Result<T> = std::result::Result<T, error::SectorStoreError>;
