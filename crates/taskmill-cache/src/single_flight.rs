use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use taskmill_sync::Gate;

/// Failure modes of a single-flight computation.
///
/// The [`Failed`](Self::Failed) and [`Panicked`](Self::Panicked) variants
/// are cached exactly like successful values: every caller for the key
/// observes a clone of the identical resolved failure.
#[derive(Clone, Debug, Error)]
pub enum ComputeError {
    /// The computation returned an error.
    #[error("computation failed: {0}")]
    Failed(Arc<anyhow::Error>),
    /// The computation panicked. The panic itself is re-raised on the
    /// computing thread; everyone else receives this error.
    #[error("computation panicked")]
    Panicked,
    /// `get` was called for a key from within the computation of that same
    /// key. Reported immediately instead of deadlocking on the gate.
    #[error("computation re-entered for its own key")]
    Reentrant,
}

impl ComputeError {
    /// The underlying failure, if this is a [`Failed`](Self::Failed) entry.
    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            ComputeError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// The per-key slot: either claimed with a computation in progress, or
/// resolved. A resolved slot never reverts.
#[derive(Debug)]
struct Slot<V> {
    claimant: Mutex<Option<ThreadId>>,
    resolved: Mutex<Option<Result<V, ComputeError>>>,
    gate: Gate,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        Slot {
            claimant: Mutex::new(None),
            resolved: Mutex::new(None),
            gate: Gate::new(),
        }
    }

    /// Claims the slot for the current thread. At most one claim ever
    /// succeeds over the lifetime of a slot.
    fn try_claim(&self) -> bool {
        let mut claimant = self.claimant.lock();
        if claimant.is_some() {
            return false;
        }
        *claimant = Some(thread::current().id());
        true
    }

    fn is_claimed_by_current_thread(&self) -> bool {
        *self.claimant.lock() == Some(thread::current().id())
    }

    /// Stores the final outcome and releases every waiter. The result is
    /// written before the gate opens, so a woken waiter always finds it.
    fn resolve(&self, result: Result<V, ComputeError>) {
        *self.resolved.lock() = Some(result);
        self.gate.signal();
    }

    fn resolved(&self) -> Option<Result<V, ComputeError>> {
        self.resolved.lock().clone()
    }

    fn await_resolved(&self) -> Result<V, ComputeError> {
        self.gate.wait();
        self.resolved()
            .expect("single-flight gate signalled without a resolved result")
    }
}

/// A single-flight memoized computation cache.
///
/// For any key, [`get`](Self::get) invokes the computation at most once no
/// matter how many threads request it concurrently; all requesters observe
/// an identical value or identical failure. Entries are created lazily and
/// only removed by explicit [`invalidate`](Self::invalidate).
pub struct SingleFlight<K, V> {
    slots: DashMap<K, Arc<Slot<V>>>,
}

impl<K: Eq + Hash, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("entries", &self.slots.len())
            .finish()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        SingleFlight {
            slots: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the memoized value for `key`, computing it if necessary.
    ///
    /// The thread that wins the claim on an unresolved key runs `compute`;
    /// everyone else blocks on the slot's gate until the claimant resolves
    /// it. A computation error is wrapped and cached like a success, so
    /// later callers re-receive the identical failure without recomputing.
    ///
    /// Calling `get` for a key from within that key's own computation is
    /// detected via the recorded claimant and fails with
    /// [`ComputeError::Reentrant`] instead of deadlocking.
    pub fn get<F>(&self, key: &K, compute: F) -> Result<V, ComputeError>
    where
        F: FnOnce(&K) -> anyhow::Result<V>,
    {
        let slot = {
            let entry = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new()));
            // Clone out of the map so no shard lock is held while computing
            // or waiting.
            Arc::clone(entry.value())
        };

        if slot.try_claim() {
            return match panic::catch_unwind(AssertUnwindSafe(|| compute(key))) {
                Ok(Ok(value)) => {
                    slot.resolve(Ok(value.clone()));
                    Ok(value)
                }
                Ok(Err(err)) => {
                    let err = ComputeError::Failed(Arc::new(err));
                    slot.resolve(Err(err.clone()));
                    Err(err)
                }
                Err(payload) => {
                    // Resolve the slot first so waiters unblock, then let
                    // the panic continue on the claimant thread.
                    slot.resolve(Err(ComputeError::Panicked));
                    panic::resume_unwind(payload);
                }
            };
        }

        if let Some(result) = slot.resolved() {
            return result;
        }
        if slot.is_claimed_by_current_thread() {
            return Err(ComputeError::Reentrant);
        }
        slot.await_resolved()
    }

    /// Peeks at an already-resolved entry without claiming or waiting.
    pub fn try_get(&self, key: &K) -> Option<Result<V, ComputeError>> {
        self.slots.get(key).and_then(|slot| slot.resolved())
    }

    /// Removes the entry for `key`; the next `get` computes afresh.
    ///
    /// Callers already blocked on the removed entry still observe its
    /// outcome.
    pub fn invalidate(&self, key: &K) {
        if self.slots.remove(key).is_some() {
            tracing::debug!("invalidated single-flight entry");
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn concurrent_gets_compute_exactly_once() {
        let cache = SingleFlight::<String, u64>::new();
        let calls = AtomicUsize::new(0);
        let key = "answer".to_string();

        thread::scope(|s| {
            let mut handles = Vec::new();
            for _ in 0..8 {
                handles.push(s.spawn(|| {
                    cache.get(&key, |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Encourage all threads to pile onto the same slot.
                        thread::sleep(Duration::from_millis(20));
                        Ok(42)
                    })
                }));
            }
            for handle in handles {
                assert_eq!(handle.join().unwrap().unwrap(), 42);
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_cached_like_successes() {
        let cache = SingleFlight::<u32, u32>::new();
        let calls = AtomicUsize::new(0);

        let first = cache.get(&1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("boom"))
        });
        let second = cache.get(&1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = first.unwrap_err();
        let second = second.unwrap_err();
        match (&first, &second) {
            (ComputeError::Failed(a), ComputeError::Failed(b)) => {
                // Both callers share the identical wrapped failure.
                assert!(Arc::ptr_eq(a, b));
                assert_eq!(a.to_string(), "boom");
            }
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[test]
    fn reentrant_get_fails_instead_of_deadlocking() {
        let cache = SingleFlight::<u32, u32>::new();

        let result = cache.get(&1, |_| {
            match cache.get(&1, |_| Ok(0)) {
                Err(ComputeError::Reentrant) => Err(anyhow::anyhow!("re-entered")),
                other => panic!("expected a reentrancy error, got {other:?}"),
            }
        });

        assert!(matches!(result, Err(ComputeError::Failed(_))));
    }

    #[test]
    fn distinct_keys_compute_independently() {
        let cache = SingleFlight::<u32, u32>::new();
        assert_eq!(cache.get(&1, |k| Ok(k * 10)).unwrap(), 10);
        assert_eq!(cache.get(&2, |k| Ok(k * 10)).unwrap(), 20);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_allows_recomputation() {
        let cache = SingleFlight::<u32, u32>::new();
        let calls = AtomicUsize::new(0);
        let compute = |_: &u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(5)
        };

        cache.get(&1, compute).unwrap();
        cache.get(&1, compute).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate(&1);
        cache.get(&1, compute).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn try_get_only_sees_resolved_entries() {
        let cache = SingleFlight::<u32, u32>::new();
        assert!(cache.try_get(&1).is_none());

        cache.get(&1, |_| Ok(11)).unwrap();
        assert_eq!(cache.try_get(&1).unwrap().unwrap(), 11);
    }

    #[test]
    fn panicking_computation_unblocks_waiters() {
        let cache = Arc::new(SingleFlight::<u32, u32>::new());

        let claimant = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let _ = cache.get(&1, |_| -> anyhow::Result<u32> {
                    thread::sleep(Duration::from_millis(20));
                    panic!("computation exploded");
                });
            })
        };

        // Give the claimant time to win the slot, then pile on as a waiter.
        thread::sleep(Duration::from_millis(5));
        let waited = cache.get(&1, |_| Ok(99));

        assert!(matches!(waited, Err(ComputeError::Panicked)));
        // The panic is re-raised on the claimant thread.
        assert!(claimant.join().is_err());
    }
}
