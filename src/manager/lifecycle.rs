use crate::error::SectorStoreError;
use crate::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Draining,
    Closed,
}

/// Admission of operations and drain-on-close.
///
/// Admission and the `Running -> Draining` switch both happen under
/// `in_flight`, so no operation slips in after `close` started waiting.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

pub(crate) struct OperationGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            state: AtomicU8::new(RUNNING),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            RUNNING => State::Running,
            DRAINING => State::Draining,
            _ => State::Closed,
        }
    }

    /// Register an operation, refused once closing has started.
    pub fn begin(&self) -> Result<OperationGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if self.state.load(Ordering::Acquire) != RUNNING {
            return Err(SectorStoreError::ShuttingDown);
        }
        *in_flight += 1;
        Ok(OperationGuard { lifecycle: self })
    }

    /// Stop admitting operations. Only the first call succeeds.
    pub fn begin_close(&self) -> Result<()> {
        let _in_flight = self.in_flight.lock().unwrap();
        self.state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| SectorStoreError::AlreadyShutDown)
    }

    /// Block until every admitted operation finished.
    pub fn wait_drained(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        while *in_flight > 0 {
            in_flight = self.drained.wait(in_flight).unwrap();
        }
    }

    pub fn set_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap()
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.lifecycle.in_flight.lock().unwrap();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.lifecycle.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::SectorStoreError;
    use crate::manager::lifecycle::{Lifecycle, State};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_drain() {
        let lifecycle = Arc::new(Lifecycle::new());
        let (started, started_recv) = crossbeam_channel::bounded(1);
        let (finish, finish_recv) = crossbeam_channel::bounded::<()>(1);

        let lifecycle2 = lifecycle.clone();
        let handle = std::thread::spawn(move || {
            let _op = lifecycle2.begin().unwrap();
            started.send(()).unwrap();
            finish_recv.recv().unwrap();
        });
        started_recv.recv().unwrap();
        assert_eq!(1, lifecycle.in_flight());

        lifecycle.begin_close().unwrap();
        assert_eq!(State::Draining, lifecycle.state());
        assert_eq!(
            SectorStoreError::ShuttingDown,
            lifecycle.begin().err().unwrap()
        );
        assert_eq!(
            SectorStoreError::AlreadyShutDown,
            lifecycle.begin_close().unwrap_err()
        );

        let (drained, drained_recv) = crossbeam_channel::bounded(1);
        let lifecycle3 = lifecycle.clone();
        let waiter = std::thread::spawn(move || {
            lifecycle3.wait_drained();
            drained.send(()).unwrap();
        });
        assert!(drained_recv.recv_timeout(Duration::from_millis(50)).is_err());
        finish.send(()).unwrap();
        drained_recv.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        waiter.join().unwrap();

        lifecycle.set_closed();
        assert_eq!(State::Closed, lifecycle.state());
        assert_eq!(0, lifecycle.in_flight());
    }
}
