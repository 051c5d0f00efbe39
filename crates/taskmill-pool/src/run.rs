use std::sync::Arc;

use taskmill_sync::CancelMonitor;

use crate::{bounded, PoolConfig, PoolError, TaskError};

/// Runs one unit of work per item on a bounded pool and synchronizes.
///
/// A thin convenience over [`bounded`] + `offer` + `close` for
/// tightly-coupled batches; failures surface exactly as `close` would
/// surface them. No ordering is guaranteed among the items.
pub fn run_all<T, I, W>(
    items: I,
    concurrency: usize,
    config: PoolConfig,
    monitor: Arc<dyn CancelMonitor>,
    worker: W,
) -> Result<(), PoolError>
where
    I: IntoIterator<Item = T>,
    T: Send + 'static,
    W: Fn(T) -> Result<(), TaskError> + Send + Sync + 'static,
{
    let pool = bounded(concurrency, config, monitor);
    let worker = Arc::new(worker);
    for item in items {
        let worker = Arc::clone(&worker);
        pool.offer(Box::new(move || worker(item)))?;
    }
    pool.close()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use taskmill_sync::NeverCancelled;

    use crate::{FailureKind, PoolError};

    use super::*;

    #[test]
    fn runs_every_item() {
        let sum = Arc::new(AtomicU64::new(0));
        let total = Arc::clone(&sum);

        run_all(
            1..=100u64,
            4,
            PoolConfig::default(),
            Arc::new(NeverCancelled),
            move |n| {
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(sum.load(Ordering::SeqCst), 5050);
    }

    #[test]
    fn failures_surface_like_close() {
        let result = run_all(
            0..10u32,
            2,
            PoolConfig::default(),
            Arc::new(NeverCancelled),
            |n| {
                if n % 2 == 1 {
                    return Err(anyhow::anyhow!("odd item {n}").into());
                }
                Ok(())
            },
        );

        match result {
            Err(PoolError::Execution(failure)) => {
                assert_eq!(failure.kind(), FailureKind::Failed);
                assert_eq!(failure.failures().len(), 5);
            }
            other => panic!("expected an execution failure, got {other:?}"),
        }
    }

    #[test]
    fn concurrency_of_one_runs_synchronously() {
        let sum = Arc::new(AtomicU64::new(0));
        let total = Arc::clone(&sum);

        run_all(
            1..=10u64,
            1,
            PoolConfig::default(),
            Arc::new(NeverCancelled),
            move |n| {
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(sum.load(Ordering::SeqCst), 55);
    }
}
