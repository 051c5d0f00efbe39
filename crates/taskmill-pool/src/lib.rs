//! Work pools for the taskmill execution engine.
//!
//! A work pool runs a stream of opaque, possibly-failing units of work
//! across zero or more background threads. Three variants share one
//! contract:
//!
//! - [`bounded`] — at most a fixed number of worker threads; offered work
//!   is handed to an idle worker, spawns a new worker up to the maximum, or
//!   queues for the next worker that becomes idle. Collapses to the direct
//!   pool for a concurrency of 0 or 1.
//! - [`elastic`] — grow on demand: work is handed directly to a parked
//!   idle thread if one exists, otherwise a new thread is spawned. Idle
//!   threads retire after a configurable timeout.
//! - direct — synchronous execution on the offering thread.
//!
//! No ordering is guaranteed among concurrently offered work. Failures are
//! captured where they occur, aggregated, and surfaced as one
//! [`ExecutionFailure`] when the pool synchronizes — every captured
//! failure is carried, never only the first. Cancellation is cooperative
//! throughout: the host-supplied [`CancelMonitor`] is polled after every
//! unit of work.

mod bounded;
mod config;
mod direct;
mod elastic;
mod error;
mod run;

use std::sync::Arc;

pub use taskmill_sync::{CancelFlag, CancelMonitor, NeverCancelled};

pub use bounded::BoundedPool;
pub use config::PoolConfig;
pub use direct::DirectPool;
pub use elastic::ElasticPool;
pub use error::{ExecutionFailure, FailureKind, PoolClosed, PoolError, TaskError};
pub use run::run_all;

/// A unit of work: an opaque, possibly-failing, zero-argument action.
///
/// The pool provides no result channel; work that produces a value must
/// embed its own hand-off.
pub type Work = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// The common contract of all pool variants.
pub trait WorkPool: Send + Sync {
    /// Schedules a unit of work.
    ///
    /// Never blocks the caller (the direct pool, configured for a
    /// concurrency of at most 1, runs the work inline instead). Only a pool
    /// that has fully terminated refuses work: while offered work is still
    /// running, even a closing pool accepts more.
    fn offer(&self, work: Work) -> Result<(), PoolClosed>;

    /// Waits for all offered work to finish, then permanently retires the
    /// pool, surfacing the aggregated failure record if any.
    ///
    /// If the cancellation monitor fires while waiting, the bounded pool
    /// cascades the cancellation to its workers and keeps waiting; the
    /// elastic pool keeps waiting without a cascade.
    fn close(&self) -> Result<(), PoolError>;

    /// Like [`close`](Self::close), but a fired cancellation monitor makes
    /// the call return [`PoolError::WaitCancelled`] immediately, leaving
    /// the pool alive with its outstanding work.
    fn close_cancellable(&self) -> Result<(), PoolError>;

    /// Waits for all offered work to finish and surfaces the aggregated
    /// failure record, keeping the pool usable afterwards.
    fn reset(&self) -> Result<(), PoolError>;

    /// Like [`reset`](Self::reset), but cancellable the same way
    /// [`close_cancellable`](Self::close_cancellable) is.
    fn reset_cancellable(&self) -> Result<(), PoolError>;

    /// Requests that no further idle capacity be created. Does not block
    /// and does not drain.
    fn exit(&self);
}

/// Creates a bounded pool running at most `max_workers` threads.
///
/// A concurrency of 0 or 1 collapses to direct, synchronous execution on
/// the offering thread.
pub fn bounded(
    max_workers: usize,
    config: PoolConfig,
    monitor: Arc<dyn CancelMonitor>,
) -> Box<dyn WorkPool> {
    if max_workers <= 1 {
        Box::new(DirectPool::new(monitor))
    } else {
        Box::new(BoundedPool::new(max_workers, config, monitor))
    }
}

/// Creates an elastic pool that grows on demand and retires idle threads
/// after the configured timeout.
pub fn elastic(config: PoolConfig, monitor: Arc<dyn CancelMonitor>) -> Box<dyn WorkPool> {
    Box::new(ElasticPool::new(config, monitor))
}
