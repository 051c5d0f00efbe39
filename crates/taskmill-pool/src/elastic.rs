use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::{Condvar, Mutex};

use taskmill_sync::CancelMonitor;

use crate::error::FailureLog;
use crate::{PoolClosed, PoolConfig, PoolError, Work, WorkPool};

/// How often a drain wait re-checks the cancellation monitor.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A work pool with no fixed worker cap.
///
/// `offer` first tries to hand the work directly to a thread that is
/// currently parked waiting; if none is waiting a new thread is spawned
/// with the work as its first item. There is no shared queue on the hot
/// path, at the cost of potentially spawning more threads than a bounded
/// pool would.
///
/// Idle workers park with a deadline and retire themselves when the
/// configured [`idle_timeout`](PoolConfig::idle_timeout) elapses without a
/// hand-off.
pub struct ElasticPool {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Drain callers park here until every worker thread has retired.
    quiescent: Condvar,
    /// LIFO stack of parked workers available for a direct hand-off.
    waiters: Mutex<Vec<Arc<HandoffSlot>>>,
    monitor: Arc<dyn CancelMonitor>,
    config: PoolConfig,
    next_worker: AtomicUsize,
}

#[derive(Default)]
struct PoolState {
    threads: usize,
    /// Offered work still on its way to a waiter or a fresh thread.
    dispatching: usize,
    offered: u64,
    completed: u64,
    /// Set by `exit`, `close` and `reset`: idle workers retire as soon as
    /// no offered work remains.
    finishing: bool,
    /// Set by `close` only; a closed pool cannot be reset.
    closed: bool,
    cancel_seen: bool,
    log: FailureLog,
}

impl PoolState {
    fn is_drained(&self) -> bool {
        self.completed == self.offered
    }

    fn should_decline(&self) -> bool {
        self.log.has_abort() || self.cancel_seen
    }

    /// Whether parked workers should stop waiting for a hand-off.
    fn should_release_idle(&self) -> bool {
        self.should_decline() || (self.finishing && self.is_drained())
    }
}

/// The hand-off cell of one parked worker. An offerer pops the slot from
/// the waiter stack and delivers into it; a worker whose idle deadline
/// passed retires the slot so late deliveries fail over to the next waiter.
struct HandoffSlot {
    state: Mutex<SlotState>,
    unparker: Unparker,
}

enum SlotState {
    Empty,
    Delivered(Work),
    Retired,
}

impl HandoffSlot {
    fn new(unparker: Unparker) -> Self {
        HandoffSlot {
            state: Mutex::new(SlotState::Empty),
            unparker,
        }
    }

    /// Attempts the hand-off; returns the work if the owner already
    /// retired or was served.
    fn deliver(&self, work: Work) -> Result<(), Work> {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Delivered(work);
            drop(state);
            self.unparker.unpark();
            Ok(())
        } else {
            Err(work)
        }
    }

    fn take_delivered(&self) -> Option<Work> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Empty) {
            SlotState::Delivered(work) => Some(work),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Refuses further deliveries; a last-instant delivery that raced the
    /// deadline is returned and still runs.
    fn retire(&self) -> Option<Work> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Retired) {
            SlotState::Delivered(work) => Some(work),
            _ => None,
        }
    }

    fn wake(&self) {
        self.unparker.unpark();
    }
}

impl ElasticPool {
    pub fn new(config: PoolConfig, monitor: Arc<dyn CancelMonitor>) -> Self {
        ElasticPool {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                quiescent: Condvar::new(),
                waiters: Mutex::new(Vec::new()),
                monitor,
                config,
                next_worker: AtomicUsize::new(0),
            }),
        }
    }

    fn spawn_worker(&self, first: Work) {
        let shared = Arc::clone(&self.shared);
        {
            let mut state = shared.state.lock();
            state.threads += 1;
            state.dispatching -= 1;
        }
        let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{id}", shared.config.name_prefix);
        tracing::debug!(worker = %name, "spawning elastic pool worker");

        let spawned = thread::Builder::new().name(name).spawn({
            let shared = Arc::clone(&shared);
            move || worker_loop(shared, first)
        });

        if let Err(err) = spawned {
            let mut state = shared.state.lock();
            state.threads -= 1;
            state
                .log
                .record_failure(anyhow::anyhow!("failed to spawn worker thread: {err}"));
            drop(state);
            shared.quiescent.notify_all();
        }
    }

    fn wake_waiters_if_drained(&self) {
        let release = self.shared.state.lock().should_release_idle();
        if release {
            wake_all_waiters(&self.shared);
        }
    }

    /// Waits until every worker thread has retired, then surfaces the
    /// failure record. The elastic pool never cascades cancellation.
    fn drain(&self, cancellable: bool) -> Result<(), PoolError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.threads == 0 && state.dispatching == 0 {
                let undone = state.offered > state.completed;
                state.offered = 0;
                state.completed = 0;
                state.cancel_seen = false;
                return match state.log.take().into_failure(undone) {
                    Some(failure) => Err(failure.into()),
                    None => Ok(()),
                };
            }
            if cancellable && shared.monitor.is_cancelled() {
                return Err(PoolError::WaitCancelled);
            }
            if state.should_release_idle() {
                // Re-wake any worker that parked after the initial wake.
                wake_all_waiters(shared);
            }
            shared.quiescent.wait_for(&mut state, MONITOR_POLL_INTERVAL);
        }
    }

    fn finish_and_drain(&self, cancellable: bool) -> Result<(), PoolError> {
        self.wake_waiters_if_drained();
        let result = self.drain(cancellable);
        if !matches!(result, Err(PoolError::WaitCancelled)) {
            self.shared.state.lock().finishing = false;
        }
        result
    }
}

impl WorkPool for ElasticPool {
    fn offer(&self, work: Work) -> Result<(), PoolClosed> {
        {
            let mut state = self.shared.state.lock();
            if (state.closed || state.finishing) && state.is_drained() {
                return Err(PoolClosed);
            }
            state.offered += 1;
            if state.should_decline() {
                // Declined; the work counts as left undone.
                return Ok(());
            }
            state.dispatching += 1;
        }

        let mut work = work;
        loop {
            let waiter = self.shared.waiters.lock().pop();
            match waiter {
                None => {
                    self.spawn_worker(work);
                    return Ok(());
                }
                Some(slot) => match slot.deliver(work) {
                    Ok(()) => {
                        tracing::trace!("handed work to a parked worker");
                        self.shared.state.lock().dispatching -= 1;
                        return Ok(());
                    }
                    Err(returned) => work = returned,
                },
            }
        }
    }

    fn close(&self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.finishing = true;
        }
        self.wake_waiters_if_drained();
        self.drain(false)
    }

    fn close_cancellable(&self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.finishing = true;
        }
        self.wake_waiters_if_drained();
        self.drain(true)
    }

    fn reset(&self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PoolClosed.into());
            }
            state.finishing = true;
        }
        self.finish_and_drain(false)
    }

    fn reset_cancellable(&self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PoolClosed.into());
            }
            state.finishing = true;
        }
        self.finish_and_drain(true)
    }

    fn exit(&self) {
        self.shared.state.lock().finishing = true;
        self.wake_waiters_if_drained();
    }
}

fn wake_all_waiters(shared: &Shared) {
    let waiters = std::mem::take(&mut *shared.waiters.lock());
    for slot in waiters {
        slot.wake();
    }
}

fn worker_loop(shared: Arc<Shared>, first: Work) {
    tracing::trace!("elastic pool worker started");
    let parker = Parker::new();
    let mut next = Some(first);
    while let Some(work) = next.take() {
        run_and_record(&shared, work);
        next = acquire_next(&shared, &parker);
    }

    let mut state = shared.state.lock();
    state.threads -= 1;
    drop(state);
    shared.quiescent.notify_all();
    tracing::trace!("elastic pool worker retired");
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
    // The externally supplied monitor is polled after every unit of work.
    if !state.cancel_seen && shared.monitor.is_cancelled() {
        state.cancel_seen = true;
        state.log.record_cancellation("cancelled by the pool monitor");
    }
    let release_idle = state.should_release_idle();
    drop(state);
    if release_idle {
        wake_all_waiters(shared);
    }
}

/// Parks until work is handed off, the pool finishes, or the idle deadline
/// passes. Returns `None` when the worker should retire.
fn acquire_next(shared: &Shared, parker: &Parker) -> Option<Work> {
    {
        let state = shared.state.lock();
        if state.should_release_idle() {
            return None;
        }
    }

    let slot = Arc::new(HandoffSlot::new(parker.unparker().clone()));
    shared.waiters.lock().push(Arc::clone(&slot));

    let deadline = Instant::now() + shared.config.idle_timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        parker.park_timeout(deadline - now);
        if let Some(work) = slot.take_delivered() {
            return Some(work);
        }
        let state = shared.state.lock();
        if state.should_release_idle() {
            break;
        }
    }

    // A delivery that raced the deadline still runs.
    slot.retire()
}
