//! Storage Module Tests
//!
//! ## Test Scopes
//! - **Item operations**: `apply_op` semantics on a bare shard.
//! - **Routing**: owners agree across ranks; custom partition maps.
//! - **Visibility**: remote writes after a fence, read-your-write on the
//!   owner, absent keys, per-channel write order.
//! - **Operations**: remote and local `invoke`, detached invocations, errors.
//! - **Lifecycle**: local helpers and `destroy`.

#[cfg(test)]
mod tests {
    use crate::error::WorldError;
    use crate::group::types::Rank;
    use crate::rmi::types::Dispatch;
    use crate::storage::handlers::apply_op;
    use crate::storage::memory::DistributedMap;
    use crate::storage::partitioner::FnPartition;
    use crate::testing::run_ranks;
    use dashmap::DashMap;
    use std::time::Duration;

    fn first_key_owned_by(map: &DistributedMap<u64, String>, rank: Rank) -> u64 {
        (0u64..)
            .find(|key| map.owner(key) == rank)
            .expect("some key maps to every rank")
    }

    // ============================================================
    // TEST 1: apply_op
    // ============================================================

    #[test]
    fn test_apply_op_creates_updates_and_removes() {
        // ARRANGE
        let shard: DashMap<String, u64> = DashMap::new();
        let add = |_: &String, item: &mut Option<u64>, delta: u64| {
            let next = item.unwrap_or(0) + delta;
            *item = if next == 0 { None } else { Some(next) };
            Ok(next)
        };

        // ACT / ASSERT: absent key is created
        assert_eq!(apply_op(&shard, "a".to_string(), 2, &add).unwrap(), 2);
        assert_eq!(*shard.get("a").unwrap(), 2);

        // existing key is updated
        assert_eq!(apply_op(&shard, "a".to_string(), 3, &add).unwrap(), 5);
        assert_eq!(*shard.get("a").unwrap(), 5);

        // clearing the item removes the key
        let clear = |_: &String, item: &mut Option<u64>, _: ()| Ok(item.take());
        assert_eq!(apply_op(&shard, "a".to_string(), (), &clear).unwrap(), Some(5));
        assert!(shard.is_empty());
    }

    #[test]
    fn test_failed_op_leaves_item_untouched() {
        let shard: DashMap<u64, String> = DashMap::new();
        shard.insert(1, "kept".to_string());

        let refuse = |_: &u64, item: &mut Option<String>, _: ()| -> anyhow::Result<()> {
            *item = None;
            anyhow::bail!("refused")
        };

        let result = apply_op(&shard, 1, (), &refuse);

        assert!(result.is_err());
        assert_eq!(*shard.get(&1).unwrap(), "kept");
    }

    // ============================================================
    // TEST 2: Routing
    // ============================================================

    #[test]
    fn test_owner_is_identical_on_every_rank() {
        let owners = run_ranks(3, |world| {
            let map = DistributedMap::<u64, String>::new(&world).unwrap();
            let keys: Vec<u64> = (0..200).collect();
            map.verify_owners(&keys).unwrap();
            keys.iter().map(|key| map.owner(key)).collect::<Vec<_>>()
        });

        assert_eq!(owners[0], owners[1]);
        assert_eq!(owners[1], owners[2]);
        assert!(owners[0].iter().all(|&owner| owner < 3));
        // Every rank owns something.
        for rank in 0..3 {
            assert!(owners[0].contains(&rank));
        }
    }

    #[test]
    fn test_rank_dependent_partition_is_detected() {
        let results = run_ranks(3, |world| {
            let rank = world.rank();
            let skew = if rank == 1 { 1 } else { 0 };
            let map = DistributedMap::<u64, u64>::with_partition(
                &world,
                FnPartition(move |key: &u64| ((*key as usize) + skew) % 3),
            )
            .unwrap();
            map.verify_owners(&[0, 1, 2])
        });

        for result in results {
            assert_eq!(result, Err(WorldError::PartitionMismatch { ranks: vec![1] }));
        }
    }

    #[test]
    fn test_out_of_range_owner_is_rejected() {
        run_ranks(2, |world| {
            let map =
                DistributedMap::<u64, u64>::with_partition(&world, FnPartition(|_: &u64| -> Rank { 7 })).unwrap();

            assert!(matches!(
                map.replace(1, 1),
                Err(WorldError::PartitionMismatch { .. })
            ));
            assert!(map.find(&1).get().is_err());
        });
    }

    // ============================================================
    // TEST 3: Visibility
    // ============================================================

    #[test]
    fn test_replace_fence_find_on_every_rank() {
        const KEYS: u64 = 64;
        let results = run_ranks(4, |world| {
            let map = DistributedMap::<u64, String>::new(&world).unwrap();

            if world.rank() == 0 {
                for key in 0..KEYS {
                    map.replace(key, format!("v{}", key)).unwrap();
                }
            }
            world.fence();

            (0..KEYS)
                .map(|key| map.find(&key).get().unwrap())
                .collect::<Vec<_>>()
        });

        for found in results {
            let expected: Vec<_> = (0..KEYS).map(|key| Some(format!("v{}", key))).collect();
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn test_write_to_rank_two_lands_only_in_its_shard() {
        // ARRANGE / ACT: rank 0 writes a key owned by rank 2
        let results = run_ranks(4, |world| {
            let map = DistributedMap::<u64, String>::new(&world).unwrap();
            let key = first_key_owned_by(&map, 2);

            if world.rank() == 0 {
                map.replace(key, "a".to_string()).unwrap();
            }
            world.fence();

            (map.owner(&key), map.get_local(&key), map.local_size())
        });

        // ASSERT
        for (rank, (owner, local, size)) in results.into_iter().enumerate() {
            assert_eq!(owner, 2);
            if rank == 2 {
                assert_eq!(local, Some("a".to_string()));
                assert_eq!(size, 1);
            } else {
                assert_eq!(local, None);
                assert_eq!(size, 0);
            }
        }
    }

    #[test]
    fn test_read_your_write_on_owner_without_fence() {
        run_ranks(3, |world| {
            let map = DistributedMap::<u64, String>::new(&world).unwrap();
            let key = first_key_owned_by(&map, world.rank());

            map.replace(key, "mine".to_string()).unwrap();

            assert!(map.is_local(&key));
            assert!(map.probe(&key));
            let found = map.find(&key);
            assert!(found.is_ready());
            assert_eq!(found.get(), Ok(Some("mine".to_string())));
        });
    }

    #[test]
    fn test_find_absent_key_returns_none_promptly() {
        run_ranks(2, |world| {
            let map = DistributedMap::<u64, String>::new(&world).unwrap();
            let remote = first_key_owned_by(&map, 1 - world.rank());

            let found = map.find(&remote).get_timeout(Duration::from_secs(5));

            assert_eq!(found, Some(Ok(None)));
        });
    }

    #[test]
    fn test_writes_from_one_sender_apply_in_order() {
        let results = run_ranks(2, |world| {
            let map = DistributedMap::<u64, u64>::new(&world).unwrap();
            let key = (0u64..).find(|key| map.owner(key) == 1).unwrap();

            if world.rank() == 0 {
                for value in 0..500 {
                    map.replace(key, value).unwrap();
                }
                map.erase(key).unwrap();
                map.replace(key, 999).unwrap();
            }
            world.fence();
            map.find(&key).get().unwrap()
        });

        assert_eq!(results, vec![Some(999), Some(999)]);
    }

    #[test]
    fn test_erase_remote_and_local() {
        run_ranks(2, |world| {
            let map = DistributedMap::<u64, String>::new(&world).unwrap();
            for key in 0..20 {
                if key % 2 == world.rank() as u64 {
                    map.replace(key, "x".to_string()).unwrap();
                }
            }
            world.fence();

            if world.rank() == 0 {
                for key in 0..10 {
                    map.erase(key).unwrap();
                }
            }
            world.fence();

            for key in 0..20 {
                let expected = if key < 10 { None } else { Some("x".to_string()) };
                assert_eq!(map.find(&key).get(), Ok(expected));
            }
        });
    }

    // ============================================================
    // TEST 4: Item operations
    // ============================================================

    #[test]
    fn test_invoke_counts_on_the_owner() {
        let totals = run_ranks(3, |world| {
            let map = DistributedMap::<String, u64>::new(&world).unwrap();
            map.register_op("add", Dispatch::Inline, |_, item: &mut Option<u64>, delta: u64| {
                let total = item.unwrap_or(0) + delta;
                *item = Some(total);
                Ok(total)
            })
            .unwrap();
            world.fence();

            // Every rank adds to the same counter, local or remote.
            for _ in 0..10 {
                map.invoke::<u64, u64>("hits".to_string(), "add", 1)
                    .get()
                    .unwrap();
            }
            world.fence();

            map.find(&"hits".to_string()).get().unwrap()
        });

        assert_eq!(totals, vec![Some(30), Some(30), Some(30)]);
    }

    #[test]
    fn test_invoke_detached_with_pool_dispatch() {
        let totals = run_ranks(2, |world| {
            let map = DistributedMap::<u64, Vec<u64>>::new(&world).unwrap();
            map.register_op("push", Dispatch::Pool, |_, item: &mut Option<Vec<u64>>, v: u64| {
                item.get_or_insert_with(Vec::new).push(v);
                Ok(())
            })
            .unwrap();
            world.fence();

            for key in 0..8u64 {
                map.invoke_detached(key, "push", world.rank() as u64).unwrap();
            }
            world.fence();

            let mut lens = 0;
            map.for_each_local(|_, values| lens += values.len());
            world.collective().allreduce_sum(vec![lens as u64]).unwrap()[0]
        });

        assert_eq!(totals, vec![16, 16]);
    }

    #[test]
    fn test_invoke_errors_reach_the_caller() {
        run_ranks(2, |world| {
            let map = DistributedMap::<u64, u64>::new(&world).unwrap();
            map.register_op::<(), (), _>("refuse", Dispatch::Inline, |key: &u64, _, _| {
                anyhow::bail!("key {} is read-only", key)
            })
            .unwrap();
            world.fence();

            for key in 0..4u64 {
                let err = map.invoke::<(), ()>(key, "refuse", ()).get().unwrap_err();
                match err {
                    WorldError::RemoteHandler { rank, message, .. } => {
                        assert_eq!(rank, map.owner(&key));
                        assert_eq!(message, format!("key {} is read-only", key));
                    }
                    other => panic!("unexpected error {:?}", other),
                }
            }

            let missing = map.invoke::<(), ()>(0, "nope", ()).get();
            assert!(matches!(missing, Err(WorldError::HandlerNotFound { .. })));
        });
    }

    #[test]
    fn test_panicking_op_fails_alike_on_owner_and_remote() {
        let outcomes = run_ranks(2, |world| {
            let map = DistributedMap::<u64, u64>::new(&world).unwrap();
            map.register_op::<(), (), _>(
                "jam",
                Dispatch::Inline,
                |_: &u64, _: &mut Option<u64>, _: ()| -> anyhow::Result<()> { panic!("jammed") },
            )
            .unwrap();
            let local = first_owned(&map, world.rank());
            let remote = first_owned(&map, 1 - world.rank());
            map.replace(local, 7).unwrap();
            world.fence();

            let on_owner = map.invoke::<(), ()>(local, "jam", ()).get();
            let from_peer = map.invoke::<(), ()>(remote, "jam", ()).get();
            (on_owner, from_peer, map.get_local(&local))
        });

        for (on_owner, from_peer, item) in outcomes {
            for outcome in [on_owner, from_peer] {
                match outcome {
                    Err(WorldError::RemoteHandler { message, .. }) => assert_eq!(message, "jammed"),
                    other => panic!("expected a handler failure, got {:?}", other),
                }
            }
            assert_eq!(item, Some(7));
        }
    }

    // ============================================================
    // TEST 5: Lifecycle
    // ============================================================

    #[test]
    fn test_local_entries_partition_the_key_space() {
        let entries = run_ranks(3, |world| {
            let map = DistributedMap::<u64, u64>::new(&world).unwrap();
            if world.rank() == 1 {
                for key in 0..90 {
                    map.replace(key, key * 2).unwrap();
                }
            }
            world.fence();

            let entries = map.local_entries();
            assert_eq!(entries.len(), map.local_size());
            assert!(entries.iter().all(|(key, _)| map.is_local(key)));
            entries
        });

        let mut all: Vec<(u64, u64)> = entries.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, (0..90).map(|key| (key, key * 2)).collect::<Vec<_>>());
    }

    #[test]
    fn test_destroy_unregisters_handlers_and_clears_shard() {
        run_ranks(2, |world| {
            let before = world.rmi().registry().handler_count();
            let map = DistributedMap::<u64, u64>::new(&world).unwrap();
            map.register_op("noop", Dispatch::Inline, |_, _: &mut Option<u64>, _: ()| Ok(()))
                .unwrap();
            map.replace(first_owned(&map, world.rank()), 1).unwrap();
            assert_eq!(world.rmi().registry().handler_count(), before + 4);
            world.fence();

            map.destroy();
            map.destroy();

            assert!(map.is_destroyed());
            assert_eq!(map.local_size(), 0);
            assert_eq!(world.rmi().registry().handler_count(), before);
            world.verify_handlers().unwrap();
        });
    }

    #[test]
    fn test_clear_local_empties_only_this_rank() {
        let sizes = run_ranks(2, |world| {
            let map = DistributedMap::<u64, u64>::new(&world).unwrap();
            for key in 0..40 {
                if map.is_local(&key) {
                    map.replace(key, key).unwrap();
                }
            }
            world.fence();
            if world.rank() == 0 {
                map.clear_local();
            }
            world.fence();
            map.local_size()
        });

        assert_eq!(sizes[0], 0);
        assert!(sizes[1] > 0);
    }

    fn first_owned(map: &DistributedMap<u64, u64>, rank: Rank) -> u64 {
        (0u64..).find(|key| map.owner(key) == rank).unwrap()
    }
}
