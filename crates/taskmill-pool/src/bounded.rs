use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use taskmill_sync::CancelMonitor;

use crate::error::FailureLog;
use crate::{PoolClosed, PoolConfig, PoolError, Work, WorkPool};

/// How often a drain wait re-checks the cancellation monitor.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A work pool running at most a fixed number of worker threads.
///
/// `offer` hands work to an idle worker, spawns a new worker up to the
/// maximum with the work as its first item, or queues the work for the next
/// worker that becomes idle. Workers park on a condition while idle and
/// exit when the pool closes.
///
/// Meant for tightly-coupled batches: this is the one pool variant whose
/// non-cancellable close cascades an observed cancellation to its workers.
pub struct BoundedPool {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Idle workers park here until work arrives or the pool closes.
    work_available: Condvar,
    /// Drain callers park here until the pool is quiescent.
    quiescent: Condvar,
    monitor: Arc<dyn CancelMonitor>,
    config: PoolConfig,
    max_workers: usize,
    next_worker: AtomicUsize,
}

/// The pool state. Guarded by one mutex; every transition happens under it,
/// so readers never observe a partially-formed state.
#[derive(Default)]
struct PoolState {
    workers: usize,
    idle: usize,
    /// Offered work still on its way to the queue of a freshly spawned
    /// worker.
    dispatching: usize,
    queue: VecDeque<Work>,
    closing: bool,
    cancel_seen: bool,
    offered: u64,
    completed: u64,
    log: FailureLog,
}

impl PoolState {
    fn is_quiescent(&self) -> bool {
        self.dispatching == 0 && self.idle == self.workers && self.queue.is_empty()
    }

    fn is_terminated(&self) -> bool {
        self.closing && self.is_quiescent()
    }

    fn should_abandon(&self) -> bool {
        self.log.has_abort() || self.cancel_seen
    }

    fn abandon_queue(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}

impl BoundedPool {
    pub fn new(max_workers: usize, config: PoolConfig, monitor: Arc<dyn CancelMonitor>) -> Self {
        debug_assert!(max_workers >= 1);
        BoundedPool {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                quiescent: Condvar::new(),
                monitor,
                config,
                max_workers,
                next_worker: AtomicUsize::new(0),
            }),
        }
    }

    fn spawn_worker(&self, first: Work) {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{id}", shared.config.name_prefix);
        tracing::debug!(worker = %name, "spawning bounded pool worker");

        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(shared));

        match spawned {
            Ok(_) => {
                // The worker picks its first item from the queue.
                let mut state = self.shared.state.lock();
                state.dispatching -= 1;
                if state.should_abandon() {
                    // Declined like the rest of the queue; left undone.
                    drop(state);
                } else {
                    state.queue.push_front(first);
                    drop(state);
                    self.shared.work_available.notify_one();
                }
            }
            Err(err) => {
                let mut state = self.shared.state.lock();
                state.dispatching -= 1;
                state.workers -= 1;
                state
                    .log
                    .record_failure(anyhow::anyhow!("failed to spawn worker thread: {err}"));
                drop(state);
                self.shared.quiescent.notify_all();
            }
        }
    }

    /// Waits until the pool is quiescent, then surfaces the failure record.
    ///
    /// `cancellable` makes a fired monitor return the wait to the caller;
    /// `cascade` instead forwards it to the workers and keeps waiting.
    fn drain(&self, cancellable: bool, cascade: bool) -> Result<(), PoolError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.is_quiescent() {
                let undone = state.offered > state.completed;
                state.offered = 0;
                state.completed = 0;
                state.cancel_seen = false;
                return match state.log.take().into_failure(undone) {
                    Some(failure) => Err(failure.into()),
                    None => Ok(()),
                };
            }
            if shared.monitor.is_cancelled() {
                if cancellable {
                    return Err(PoolError::WaitCancelled);
                }
                if cascade && !state.cancel_seen {
                    state.cancel_seen = true;
                    state.log.record_cancellation("cancelled while draining");
                    let dropped = state.abandon_queue();
                    tracing::warn!(
                        dropped,
                        "cancellation observed while draining; cascading to workers"
                    );
                }
            }
            shared.quiescent.wait_for(&mut state, MONITOR_POLL_INTERVAL);
        }
    }
}

impl WorkPool for BoundedPool {
    fn offer(&self, work: Work) -> Result<(), PoolClosed> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.is_terminated() {
            return Err(PoolClosed);
        }
        state.offered += 1;
        if state.should_abandon() {
            // Declined; the work counts as left undone.
            return Ok(());
        }
        if state.workers < shared.max_workers && (state.idle == 0 || !state.queue.is_empty()) {
            state.workers += 1;
            state.dispatching += 1;
            drop(state);
            self.spawn_worker(work);
        } else {
            state.queue.push_back(work);
            drop(state);
            shared.work_available.notify_one();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), PoolError> {
        self.shared.state.lock().closing = true;
        self.shared.work_available.notify_all();
        self.drain(false, true)
    }

    fn close_cancellable(&self) -> Result<(), PoolError> {
        self.shared.state.lock().closing = true;
        self.shared.work_available.notify_all();
        self.drain(true, false)
    }

    fn reset(&self) -> Result<(), PoolError> {
        if self.shared.state.lock().closing {
            return Err(PoolClosed.into());
        }
        // Unlike close, an observed cancellation is not cascaded here.
        self.drain(false, false)
    }

    fn reset_cancellable(&self) -> Result<(), PoolError> {
        if self.shared.state.lock().closing {
            return Err(PoolClosed.into());
        }
        self.drain(true, false)
    }

    fn exit(&self) {
        // Worker capacity is fixed and retires at close; nothing to do.
    }
}

fn worker_loop(shared: Arc<Shared>) {
    tracing::trace!("bounded pool worker started");
    while let Some(work) = acquire_next(&shared) {
        run_and_record(&shared, work);
    }
    tracing::trace!("bounded pool worker exiting");
}

fn run_and_record(shared: &Shared, work: Work) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(work));
    let mut state = shared.state.lock();
    state.completed += 1;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => state.log.record(err),
        Err(payload) => state.log.record_panic(payload),
    }
    if state.log.has_abort() {
        let dropped = state.abandon_queue();
        if dropped > 0 {
            tracing::debug!(dropped, "abandoning queued work after abort");
        }
    }
    // The externally supplied monitor is polled after every unit of work.
    if !state.cancel_seen && shared.monitor.is_cancelled() {
        state.cancel_seen = true;
        state.log.record_cancellation("cancelled by the pool monitor");
        let dropped = state.abandon_queue();
        if dropped > 0 {
            tracing::debug!(dropped, "declining queued work after cancellation");
        }
    }
}

fn acquire_next(shared: &Shared) -> Option<Work> {
    let mut state = shared.state.lock();
    if let Some(work) = state.queue.pop_front() {
        return Some(work);
    }
    state.idle += 1;
    shared.quiescent.notify_all();
    loop {
        if let Some(work) = state.queue.pop_front() {
            state.idle -= 1;
            return Some(work);
        }
        if state.closing {
            state.idle -= 1;
            state.workers -= 1;
            shared.quiescent.notify_all();
            return None;
        }
        shared.work_available.wait(&mut state);
    }
}
