use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A polled cancellation capability supplied by the host.
///
/// The engine never cancels anything on its own; it only observes this
/// monitor at well-defined points (between units of work, while waiting for
/// a gate or a pool drain) and backs off cooperatively once it reports
/// cancellation.
pub trait CancelMonitor: Send + Sync {
    /// Whether the associated operation has been cancelled.
    fn is_cancelled(&self) -> bool;
}

impl<M: CancelMonitor + ?Sized> CancelMonitor for &M {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

impl<M: CancelMonitor + ?Sized> CancelMonitor for Arc<M> {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// A monitor that never reports cancellation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancelled;

impl CancelMonitor for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A shareable one-way cancellation flag.
///
/// Clones observe the same underlying flag. Once [`cancel`](Self::cancel)
/// has been called the flag stays tripped forever.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl CancelMonitor for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_trips_once_and_stays_tripped() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());

        flag.cancel();
        assert!(observer.is_cancelled());

        flag.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn never_cancelled_is_never_cancelled() {
        assert!(!NeverCancelled.is_cancelled());
    }
}
