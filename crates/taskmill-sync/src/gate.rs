use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::CancelMonitor;

/// How often a cancellable wait re-checks its monitor while blocked.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error returned by the cancellable wait variants of [`Gate`] when the
/// monitor reports cancellation before the gate is signalled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("wait cancelled before the gate was signalled")]
pub struct WaitCancelled;

/// A single-fire gate.
///
/// The gate starts closed. The first [`signal`](Self::signal) opens it
/// permanently and wakes every current and future waiter; further signals
/// have no effect.
///
/// Waits on an already-open gate return immediately without consulting the
/// cancellation monitor, so an observer of an already-resolved result is
/// never penalized by unrelated cancellation state.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate. The first call wins; later calls are no-ops.
    pub fn signal(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cond.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Blocks until the gate is signalled, ignoring cancellation.
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    /// Blocks until the gate is signalled or `timeout` elapses.
    ///
    /// Returns whether the gate is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.cond.wait_until(&mut open, deadline).timed_out() {
                return *open;
            }
        }
        true
    }

    /// Blocks until the gate is signalled, polling `monitor` while waiting.
    ///
    /// An open gate always wins: if the gate has been signalled this returns
    /// `Ok(())` even when the monitor already reports cancellation.
    pub fn wait_cancellable(&self, monitor: &dyn CancelMonitor) -> Result<(), WaitCancelled> {
        let mut open = self.open.lock();
        loop {
            if *open {
                return Ok(());
            }
            if monitor.is_cancelled() {
                return Err(WaitCancelled);
            }
            self.cond.wait_for(&mut open, CANCEL_POLL_INTERVAL);
        }
    }

    /// Blocks until the gate is signalled, `timeout` elapses, or `monitor`
    /// reports cancellation.
    ///
    /// Returns whether the gate is open; the open-gate fast path applies
    /// here as well.
    pub fn wait_timeout_cancellable(
        &self,
        timeout: Duration,
        monitor: &dyn CancelMonitor,
    ) -> Result<bool, WaitCancelled> {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        loop {
            if *open {
                return Ok(true);
            }
            if monitor.is_cancelled() {
                return Err(WaitCancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let poll_until = deadline.min(now + CANCEL_POLL_INTERVAL);
            self.cond.wait_until(&mut open, poll_until);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::CancelFlag;

    use super::*;

    #[test]
    fn signalled_gate_releases_all_waiters() {
        let gate = Arc::new(Gate::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            handles.push(thread::spawn(move || gate.wait()));
        }

        assert!(!gate.is_open());
        gate.signal();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(gate.is_open());
    }

    #[test]
    fn open_gate_ignores_cancelled_monitor() {
        let gate = Gate::new();
        gate.signal();

        let cancelled = CancelFlag::new();
        cancelled.cancel();

        // The gate is already open, so the pre-cancelled monitor must not
        // turn the wait into an error.
        assert_eq!(gate.wait_cancellable(&cancelled), Ok(()));
        assert_eq!(
            gate.wait_timeout_cancellable(Duration::from_millis(1), &cancelled),
            Ok(true)
        );
    }

    #[test]
    fn closed_gate_reports_cancellation() {
        let gate = Gate::new();
        let cancelled = CancelFlag::new();
        cancelled.cancel();

        assert_eq!(gate.wait_cancellable(&cancelled), Err(WaitCancelled));
    }

    #[test]
    fn wait_timeout_elapses_on_closed_gate() {
        let gate = Gate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(10)));

        gate.signal();
        assert!(gate.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn repeated_signals_are_noops() {
        let gate = Gate::new();
        gate.signal();
        gate.signal();
        assert!(gate.is_open());
        gate.wait();
    }

    #[test]
    fn cancellation_interrupts_a_blocked_wait() {
        let gate = Arc::new(Gate::new());
        let flag = CancelFlag::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let flag = flag.clone();
            thread::spawn(move || gate.wait_cancellable(&flag))
        };

        thread::sleep(Duration::from_millis(20));
        flag.cancel();

        assert_eq!(waiter.join().unwrap(), Err(WaitCancelled));
        // The gate itself is still closed and can be signalled later.
        assert!(!gate.is_open());
    }
}
