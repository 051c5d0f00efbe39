//! Cross-crate scenarios: pool workers driving the memoization caches, the
//! way the surrounding engine feeds them units of work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use taskmill_cache::SingleFlight;
use taskmill_pool::{bounded, elastic, NeverCancelled, PoolConfig};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn pool_workers_share_single_flight_computations() {
    init_logging();
    let pool = bounded(4, PoolConfig::default(), Arc::new(NeverCancelled));
    let cache = Arc::new(SingleFlight::<String, u64>::new());
    let computations = Arc::new(AtomicUsize::new(0));

    // 40 units of work demand 4 distinct properties; each property is
    // computed exactly once no matter which worker gets there first.
    for i in 0..40u64 {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        pool.offer(Box::new(move || {
            let key = format!("property-{}", i % 4);
            let value = cache
                .get(&key, |_| {
                    computations.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    Ok(i % 4)
                })
                .map_err(anyhow::Error::new)?;
            if value != i % 4 {
                return Err(anyhow::anyhow!("wrong value for {key}: {value}").into());
            }
            Ok(())
        }))
        .unwrap();
    }
    pool.close().unwrap();

    assert_eq!(computations.load(Ordering::SeqCst), 4);
    assert_eq!(cache.len(), 4);
}

#[test]
fn elastic_pool_runs_cache_backed_work() {
    init_logging();
    let pool = elastic(PoolConfig::default(), Arc::new(NeverCancelled));
    let cache = Arc::new(SingleFlight::<u32, u32>::new());
    let computations = Arc::new(AtomicUsize::new(0));

    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        pool.offer(Box::new(move || {
            cache
                .get(&7, |_| {
                    computations.fetch_add(1, Ordering::SeqCst);
                    Ok(49)
                })
                .map_err(anyhow::Error::new)?;
            Ok(())
        }))
        .unwrap();
    }
    pool.close().unwrap();

    assert_eq!(computations.load(Ordering::SeqCst), 1);
}
