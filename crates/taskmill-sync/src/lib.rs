//! Synchronization primitives for the taskmill execution engine.
//!
//! These primitives are deliberately small and are composed by the higher
//! layers: the single-flight cache blocks waiters on a [`Gate`], and the
//! content-addressed cache serializes per-key loads through an
//! [`ExclusiveLock`].
//!
//! Cancellation throughout the engine is cooperative: blocking operations
//! that want to be abandonable take a [`CancelMonitor`] and poll it while
//! they wait. There is no preemptive interruption anywhere.

mod cancel;
mod gate;
mod lock;

pub use cancel::{CancelFlag, CancelMonitor, NeverCancelled};
pub use gate::{Gate, WaitCancelled};
pub use lock::{ExclusiveGuard, ExclusiveLock, ReentrantAcquire};
