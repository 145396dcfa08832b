use crate::config::StorageOptions;
use crate::index::store::MetadataStore;
use crate::wal::WriteAheadLog;
use crate::Result;
use crossbeam_channel::{select, Sender};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

/// Background thread keeping the write-ahead log and the metadata store short.
pub(crate) struct Maintenance {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Maintenance {
    pub fn start(
        wal: Arc<WriteAheadLog>,
        store: Arc<MetadataStore>,
        options: &StorageOptions,
    ) -> Result<Maintenance> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let ticker = crossbeam_channel::tick(options.maintenance_interval);
        let wal_threshold = options.wal_compact_threshold;
        let metadata_threshold = options.metadata_compact_threshold;

        let handle = thread::Builder::new()
            .name("storage maintenance".to_owned())
            .spawn(move || {
                info!("thread `{}` start!", thread::current().name().unwrap_or(""));
                loop {
                    select! {
                        // disconnected once `stop` is dropped
                        recv(stopped) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = tick(&wal, &store, wal_threshold, metadata_threshold) {
                                warn!("maintenance failed, retry next tick: {}", e);
                            }
                        }
                    }
                }
                info!("thread `{}` exit!", thread::current().name().unwrap_or(""));
            })?;

        Ok(Maintenance {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it. Calling it again does nothing.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(
    wal: &WriteAheadLog,
    store: &MetadataStore,
    wal_threshold: u64,
    metadata_threshold: u64,
) -> Result<()> {
    if wal.file_len() > wal_threshold {
        wal.compact()?;
    }
    if store.log_len() > metadata_threshold {
        store.compact()?;
    }
    Ok(())
}
