use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use taskmill_sync::CancelMonitor;

use crate::error::FailureLog;
use crate::{PoolClosed, PoolError, Work, WorkPool};

/// The degenerate pool for a concurrency of 0 or 1: `offer` runs the work
/// synchronously on the offering thread.
///
/// Failures are captured into the aggregated record just like in the
/// threaded variants; the draining operations have nothing to wait for and
/// merely surface it.
pub struct DirectPool {
    monitor: Arc<dyn CancelMonitor>,
    state: Mutex<DirectState>,
}

#[derive(Default)]
struct DirectState {
    offered: u64,
    completed: u64,
    closed: bool,
    log: FailureLog,
}

impl DirectPool {
    pub fn new(monitor: Arc<dyn CancelMonitor>) -> Self {
        DirectPool {
            monitor,
            state: Mutex::new(DirectState::default()),
        }
    }

    fn surface(&self, close: bool) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if close {
            state.closed = true;
        }
        let undone = state.offered > state.completed;
        state.offered = 0;
        state.completed = 0;
        match state.log.take().into_failure(undone) {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}

impl WorkPool for DirectPool {
    fn offer(&self, work: Work) -> Result<(), PoolClosed> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolClosed);
            }
            state.offered += 1;
            if state.log.has_abort() {
                // Abandoned; the work is left undone.
                return Ok(());
            }
            if self.monitor.is_cancelled() {
                state.log.record_cancellation("cancelled by the pool monitor");
                return Ok(());
            }
        }

        // Run inline without holding the state lock.
        let outcome = panic::catch_unwind(AssertUnwindSafe(work));
        let mut state = self.state.lock();
        state.completed += 1;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => state.log.record(err),
            Err(payload) => state.log.record_panic(payload),
        }
        Ok(())
    }

    fn close(&self) -> Result<(), PoolError> {
        self.surface(true)
    }

    fn close_cancellable(&self) -> Result<(), PoolError> {
        self.surface(true)
    }

    fn reset(&self) -> Result<(), PoolError> {
        if self.state.lock().closed {
            return Err(PoolClosed.into());
        }
        self.surface(false)
    }

    fn reset_cancellable(&self) -> Result<(), PoolError> {
        self.reset()
    }

    fn exit(&self) {}
}
