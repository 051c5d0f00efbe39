use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Error returned when the thread that already holds an [`ExclusiveLock`]
/// tries to acquire it again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("exclusive lock is already held by the current thread")]
pub struct ReentrantAcquire;

/// A non-reentrant mutual exclusion lock.
///
/// Unlike a plain mutex, a second acquisition attempt from the thread that
/// already holds the lock is reported as a [`ReentrantAcquire`] error
/// instead of deadlocking silently. This is used where accidental
/// reentrancy would otherwise be a hard-to-diagnose hang, such as the
/// per-key load locks of the content cache.
#[derive(Debug, Default)]
pub struct ExclusiveLock {
    holder: Mutex<Option<ThreadId>>,
    cond: Condvar,
}

impl ExclusiveLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, blocking while another thread holds it.
    pub fn lock(&self) -> Result<ExclusiveGuard<'_>, ReentrantAcquire> {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        loop {
            match *holder {
                None => {
                    *holder = Some(me);
                    return Ok(ExclusiveGuard { lock: self });
                }
                Some(owner) if owner == me => return Err(ReentrantAcquire),
                Some(_) => self.cond.wait(&mut holder),
            }
        }
    }

    /// Acquires the lock only if it is currently free.
    ///
    /// Returns `Ok(None)` when another thread holds the lock; a reentrant
    /// attempt is still an error rather than contention.
    pub fn try_lock(&self) -> Result<Option<ExclusiveGuard<'_>>, ReentrantAcquire> {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        match *holder {
            None => {
                *holder = Some(me);
                Ok(Some(ExclusiveGuard { lock: self }))
            }
            Some(owner) if owner == me => Err(ReentrantAcquire),
            Some(_) => Ok(None),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }
}

/// RAII guard for [`ExclusiveLock`]; releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    lock: &'a ExclusiveLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.lock.holder.lock();
        *holder = None;
        self.lock.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn reentrant_acquisition_is_an_error() {
        let lock = ExclusiveLock::new();
        let _guard = lock.lock().unwrap();

        assert_eq!(lock.lock().unwrap_err(), ReentrantAcquire);
        assert_eq!(lock.try_lock().unwrap_err(), ReentrantAcquire);
    }

    #[test]
    fn release_allows_reacquisition() {
        let lock = ExclusiveLock::new();
        drop(lock.lock().unwrap());
        drop(lock.lock().unwrap());
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_reports_contention_as_none() {
        let lock = Arc::new(ExclusiveLock::new());
        let _guard = lock.lock().unwrap();

        let contender = Arc::clone(&lock);
        let result = thread::spawn(move || contender.try_lock().unwrap().is_none())
            .join()
            .unwrap();
        assert!(result);
    }

    #[test]
    fn lock_excludes_other_threads() {
        let lock = Arc::new(ExclusiveLock::new());
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let _guard = lock.lock().unwrap();
                    let mut counter = counter.lock();
                    let read = *counter;
                    // Hold the value across a reschedule point; without the
                    // lock this would lose increments.
                    thread::sleep(Duration::from_micros(10));
                    *counter = read + 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 100);
    }
}
