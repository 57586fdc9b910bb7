//! Fence Module Tests
//!
//! ## Test Scopes
//! - **Counters**: balance checks and busy-rank diagnostics.
//! - **Collectives**: allgather and allreduce across in-process ranks.
//! - **Fence**: idle fences, fences with traffic and pool work in flight,
//!   and the stall diagnostic.

#[cfg(test)]
mod tests {
    use crate::config::RuntimeConfig;
    use crate::error::WorldError;
    use crate::fence::quiescence::{QuiescenceCounts, busy_ranks};
    use crate::group::local::LocalGroup;
    use crate::rmi::types::{Dispatch, HandlerId};
    use crate::testing::run_ranks;
    use crate::world::World;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn counts(sent: u64, processed: u64, submitted: u64, completed: u64) -> QuiescenceCounts {
        QuiescenceCounts {
            sent,
            processed,
            submitted,
            completed,
        }
    }

    // ============================================================
    // TEST 1: Counters
    // ============================================================

    #[test]
    fn test_counts_balance_and_total() {
        let ranks = [counts(3, 1, 2, 2), counts(0, 2, 1, 1)];

        let total = QuiescenceCounts::total(&ranks);

        assert_eq!(total, counts(3, 3, 3, 3));
        assert!(total.is_balanced());
        assert!(!ranks[0].is_balanced());
    }

    #[test]
    fn test_counts_vector_layout() {
        let c = counts(1, 2, 3, 4);

        assert_eq!(c.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(QuiescenceCounts::from_slice(&c.to_vec()), c);
        assert_eq!(QuiescenceCounts::from_slice(&[9]), counts(9, 0, 0, 0));
    }

    #[test]
    fn test_busy_ranks_names_moving_or_working_ranks() {
        let previous = [counts(1, 1, 0, 0), counts(2, 2, 0, 0), counts(0, 0, 1, 1)];
        let last = [counts(1, 1, 0, 0), counts(3, 2, 0, 0), counts(0, 0, 2, 1)];

        assert_eq!(busy_ranks(&previous, &last), vec![1, 2]);
        // Nobody stands out: every rank is reported.
        assert_eq!(busy_ranks(&last, &last[..1]), vec![0]);
    }

    // ============================================================
    // TEST 2: Collectives
    // ============================================================

    #[test]
    fn test_allgather_returns_table_by_rank() {
        let tables = run_ranks(3, |world| {
            let rank = world.rank() as u64;
            world
                .collective()
                .allgather(vec![rank, rank * 10])
                .unwrap()
        });

        for table in tables {
            assert_eq!(table, vec![vec![0, 0], vec![1, 10], vec![2, 20]]);
        }
    }

    #[test]
    fn test_allreduce_sum_over_repeated_rounds() {
        let results = run_ranks(4, |world| {
            (0..5u64)
                .map(|round| {
                    world
                        .collective()
                        .allreduce_sum(vec![round, world.rank() as u64])
                        .unwrap()
                })
                .collect::<Vec<_>>()
        });

        for per_rank in results {
            for (round, sums) in per_rank.into_iter().enumerate() {
                assert_eq!(sums, vec![4 * round as u64, 6]);
            }
        }
    }

    // ============================================================
    // TEST 3: Fence
    // ============================================================

    #[test]
    fn test_idle_fence_takes_two_rounds() {
        let reports = run_ranks(3, |world| (world.fence(), world.fence()));

        for (first, second) in reports {
            assert_eq!(first.rounds, 2);
            assert_eq!(first.epoch, 1);
            assert_eq!(second.rounds, 2);
            assert_eq!(second.epoch, 2);
        }
    }

    #[test]
    fn test_fence_waits_for_every_message() {
        const PER_PEER: u64 = 200;
        let sums = run_ranks(4, |world| {
            let received = Arc::new(AtomicU64::new(0));
            let counter = received.clone();
            let id = world
                .rmi()
                .register_typed::<u64, (), _>("accumulate", Dispatch::Pool, move |_, x| {
                    std::thread::sleep(Duration::from_micros(50));
                    counter.fetch_add(x, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            world.fence();

            for target in 0..world.size() {
                for _ in 0..PER_PEER {
                    world.rmi().post(target, id, &1u64).unwrap();
                }
            }
            world.fence();

            received.load(Ordering::SeqCst)
        });

        for sum in sums {
            assert_eq!(sum, 4 * PER_PEER);
        }
    }

    #[test]
    fn test_fence_waits_for_forwarded_messages() {
        // Each hop re-sends until the ttl runs out; the fence must see the whole
        // chain, not only the messages issued by the application thread.
        let totals = run_ranks(3, |world| {
            let hops = Arc::new(AtomicU64::new(0));
            let counter = hops.clone();
            let engine = Arc::downgrade(world.rmi());
            let size = world.size();
            let rank = world.rank();
            let id = HandlerId::from_name("relay");
            world
                .rmi()
                .register_typed::<u32, (), _>("relay", Dispatch::Inline, move |_, ttl| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ttl > 0
                        && let Some(engine) = engine.upgrade()
                    {
                        engine.post((rank + 1) % size, id, &(ttl - 1))?;
                    }
                    Ok(())
                })
                .unwrap();
            world.fence();

            world.rmi().post((rank + 1) % size, id, &30u32).unwrap();
            world.fence();

            world.collective().allreduce_sum(vec![hops.load(Ordering::SeqCst)]).unwrap()
        });

        for total in totals {
            // Three chains of 31 hops each.
            assert_eq!(total, vec![3 * 31]);
        }
    }

    #[test]
    fn test_fence_waits_for_pool_tasks() {
        let done = run_ranks(2, |world| {
            let finished = Arc::new(AtomicU64::new(0));
            for _ in 0..20 {
                let finished = finished.clone();
                world
                    .pool()
                    .execute(move || {
                        std::thread::sleep(Duration::from_millis(2));
                        finished.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
            world.fence();
            finished.load(Ordering::SeqCst)
        });

        assert_eq!(done, vec![20, 20]);
    }

    #[test]
    fn test_stalled_fence_reports_the_busy_rank() {
        // ARRANGE: a task on rank 1 that outlives a tiny round budget
        let config = RuntimeConfig {
            fence_max_rounds: 3,
            fence_backoff_max_ms: 1,
            ..RuntimeConfig::default().with_workers(1)
        };
        let groups = LocalGroup::create(2);

        // ACT
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let world = World::new(group, config).unwrap();
                    let release = Arc::new(AtomicU64::new(0));
                    if world.rank() == 1 {
                        let release = release.clone();
                        world
                            .pool()
                            .execute(move || {
                                while release.load(Ordering::SeqCst) == 0 {
                                    std::thread::sleep(Duration::from_millis(1));
                                }
                            })
                            .unwrap();
                    }
                    let result = world.try_fence();
                    release.store(1, Ordering::SeqCst);
                    while world.pool().outstanding() > 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    world.shutdown().unwrap();
                    result
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // ASSERT: both ranks give up in the same round with the same diagnosis
        for result in results {
            match result {
                Err(WorldError::FenceStall {
                    rounds,
                    submitted,
                    completed,
                    ranks,
                    ..
                }) => {
                    assert_eq!(rounds, 3);
                    assert_eq!(submitted, completed + 1);
                    assert_eq!(ranks, vec![1]);
                }
                other => panic!("expected a stall, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_fence_settles_after_a_rejected_send() {
        // ARRANGE: a round budget far below what a stuck counter would need
        let config = RuntimeConfig {
            fence_max_rounds: 20,
            fence_backoff_max_ms: 1,
            ..RuntimeConfig::default().with_workers(1)
        };
        let groups = LocalGroup::create(2);

        // ACT: every rank addresses a rank outside the group, then fences
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let world = World::new(group, config).unwrap();
                    let id = HandlerId::from_name("nowhere");
                    let send = world.rmi().send(99, id, vec![1, 2, 3]);
                    let sent = world.rmi().stats().sent;
                    let fence = world.try_fence();
                    world.shutdown().unwrap();
                    (send, sent, fence)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // ASSERT: the failed send is not left counted, so the fence is idle
        for (send, sent, fence) in results {
            assert!(matches!(send, Err(WorldError::Transport { .. })));
            assert_eq!(sent, 0);
            assert_eq!(fence.unwrap().rounds, 2);
        }
    }

    #[test]
    fn test_verify_handlers_names_the_odd_rank() {
        let results = run_ranks(3, |world| {
            world
                .rmi()
                .register("common", Dispatch::Inline, |_, _| Ok(Vec::new()))
                .unwrap();
            let first = world.verify_handlers();

            if world.rank() == 2 {
                world
                    .rmi()
                    .register("extra", Dispatch::Inline, |_, _| Ok(Vec::new()))
                    .unwrap();
            }
            let second = world.verify_handlers();
            (first, second)
        });

        for (first, second) in results {
            assert_eq!(first, Ok(()));
            assert_eq!(second, Err(WorldError::HandlerMismatch { ranks: vec![2] }));
        }
    }
}
