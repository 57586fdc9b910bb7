//! Executor Module Tests
//!
//! ## Test Scopes
//! - **Future/Promise**: single assignment, blocking reads, broken promises.
//! - **ThreadPool**: exactly-once execution under concurrent producers, FIFO
//!   start order, panics, statistics and shutdown semantics.

#[cfg(test)]
mod tests {
    use crate::error::WorldError;
    use crate::executor::future::{Future, pair};
    use crate::executor::pool::ThreadPool;
    use crate::executor::types::{PoolStats, TaskState};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ============================================================
    // TEST 1: Future / Promise
    // ============================================================

    #[test]
    fn test_future_blocks_until_written() {
        // ARRANGE
        let (promise, future) = pair::<u32>();
        assert!(!future.is_ready());
        assert!(future.try_get().is_none());

        // ACT: write from another thread after a delay
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.set(42);
        });

        // ASSERT: the read waits for the value, repeated reads agree
        assert_eq!(future.get(), Ok(42));
        assert_eq!(future.get(), Ok(42));
        assert!(future.is_ready());
        writer.join().unwrap();
    }

    #[test]
    fn test_future_clones_share_the_slot() {
        let (promise, future) = pair::<String>();
        let other = future.clone();

        promise.set("shared".to_string());

        assert_eq!(future.get().unwrap(), "shared");
        assert_eq!(other.get().unwrap(), "shared");
    }

    #[test]
    fn test_dropped_promise_breaks_the_future() {
        let (promise, future) = pair::<u8>();

        drop(promise);

        assert_eq!(future.get(), Err(WorldError::BrokenPromise));
    }

    #[test]
    fn test_failed_promise_carries_the_error() {
        let (promise, future) = pair::<u8>();
        let err = WorldError::RemoteHandler {
            rank: 2,
            handler: "op".to_string(),
            message: "nope".to_string(),
        };

        promise.fail(err.clone());

        assert_eq!(future.get(), Err(err));
    }

    #[test]
    fn test_get_timeout_expires_without_writer() {
        let (_promise, future) = pair::<u8>();

        assert!(future.get_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_ready_and_failed_futures() {
        assert_eq!(Future::ready(7).get(), Ok(7));
        assert_eq!(
            Future::<u8>::failed(WorldError::PoolShutdown).try_get(),
            Some(Err(WorldError::PoolShutdown))
        );
    }

    // ============================================================
    // TEST 2: ThreadPool - Execution
    // ============================================================

    #[test]
    fn test_pool_runs_every_task_exactly_once() {
        // ARRANGE: four producers feeding one pool
        const PER_PRODUCER: usize = 250;
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        // ACT
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let counter = counter.clone();
                        pool.execute(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        pool.shutdown();

        // ASSERT
        assert_eq!(counter.load(Ordering::SeqCst), 4 * PER_PRODUCER);
        let stats = pool.stats();
        assert_eq!(stats.submitted, (4 * PER_PRODUCER) as u64);
        assert_eq!(stats.completed, (4 * PER_PRODUCER) as u64);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_submit_returns_result_through_future() {
        let pool = ThreadPool::new(2);

        let futures: Vec<_> = (0..10u64)
            .map(|i| pool.submit(move || i * i).unwrap())
            .collect();

        let results: Vec<u64> = futures.iter().map(|f| f.get().unwrap()).collect();
        assert_eq!(results, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_worker_starts_tasks_in_fifo_order() {
        let pool = ThreadPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let order = order.clone();
            pool.execute(move || order.lock().push(i)).unwrap();
        }
        pool.shutdown();

        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_task_breaks_its_future_but_not_the_pool() {
        let pool = ThreadPool::new(1);

        let failed = pool.submit(|| -> u8 { panic!("task exploded") }).unwrap();
        let fine = pool.submit(|| 5u8).unwrap();

        assert_eq!(failed.get(), Err(WorldError::BrokenPromise));
        assert_eq!(fine.get(), Ok(5));
        pool.shutdown();
        assert_eq!(pool.stats().completed, 2);
    }

    // ============================================================
    // TEST 3: ThreadPool - Shutdown
    // ============================================================

    #[test]
    fn test_shutdown_drains_queued_work() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = counter.clone();
            pool.execute(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = ThreadPool::new(2);
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shutdown());
        assert_eq!(pool.execute(|| {}), Err(WorldError::PoolShutdown));
        assert!(matches!(pool.submit(|| 1), Err(WorldError::PoolShutdown)));
    }

    #[test]
    fn test_worker_count_is_at_least_one() {
        assert_eq!(ThreadPool::new(3).worker_count(), 3);
        assert_eq!(ThreadPool::new(0).worker_count(), 1);
    }

    // ============================================================
    // TEST 4: Data Types
    // ============================================================

    #[test]
    fn test_pool_stats_state_counts() {
        let stats = PoolStats {
            submitted: 10,
            started: 7,
            completed: 4,
        };

        assert_eq!(stats.count(TaskState::Queued), 3);
        assert_eq!(stats.count(TaskState::Running), 3);
        assert_eq!(stats.count(TaskState::Done), 4);
        assert_eq!(stats.outstanding(), 6);
    }

    #[test]
    fn test_task_state_serialization() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        let back: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskState::Running);
    }
}
