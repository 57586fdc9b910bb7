use super::handlers::{register_container_handlers, register_op_handler};
use super::partitioner::{HashPartition, Partition};
use super::protocol::*;
use super::types::{ContainerHandlers, MapKey, MapValue};
use crate::error::{Result, WorldError, panic_message};
use crate::executor::future::Future;
use crate::group::types::Rank;
use crate::rmi::codec::Codec;
use crate::rmi::types::{Dispatch, HandlerId, fnv1a_64};
use crate::world::{World, disagreeing_ranks};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Associative container sharded across the ranks of a [`World`].
///
/// Each key lives in the shard of exactly one rank, its owner. Operations on
/// local keys touch the shard directly; operations on remote keys become
/// active messages to the owner.
///
/// `replace` and `erase` on remote keys are not acknowledged: another rank is
/// only guaranteed to observe them after a [`World::fence`]. Writes from one
/// rank to one owner apply in the order they were issued; writes to the same
/// key from different ranks race.
pub struct DistributedMap<K, V> {
    world: Arc<World>,
    id: u64,
    shard: Arc<DashMap<K, V>>,
    partition: Arc<dyn Partition<K>>,
    handlers: ContainerHandlers,
    ops: DashMap<String, HandlerId>,
    destroyed: AtomicBool,
}

impl<K, V> DistributedMap<K, V>
where
    K: MapKey,
    V: MapValue,
{
    /// Creates a container with the default hash partition map.
    ///
    /// Collective: every rank must create its containers in the same order.
    /// Returns once the container exists everywhere.
    pub fn new(world: &Arc<World>) -> Result<Self> {
        let partition = HashPartition::with_partitions(world.config().partitions, world.size());
        Self::with_partition(world, partition)
    }

    /// Like [`new`](Self::new) with a custom partition map, which must be
    /// the same pure function on every rank.
    pub fn with_partition(world: &Arc<World>, partition: impl Partition<K> + 'static) -> Result<Self> {
        let id = world.next_container_id();
        let shard = Arc::new(DashMap::new());
        let handlers = register_container_handlers(world.rmi(), id, &shard)?;

        // Nobody may send to this container before every rank registered it.
        let ids = world.collective().allgather(vec![id])?;
        let ranks = disagreeing_ranks(&ids);
        if !ranks.is_empty() {
            return Err(WorldError::HandlerMismatch { ranks });
        }

        tracing::info!("Created distributed map {} on rank {}", id, world.rank());

        Ok(Self {
            world: world.clone(),
            id,
            shard,
            partition: Arc::new(partition),
            handlers,
            ops: DashMap::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self, key: &K) -> Rank {
        self.partition.owner(key)
    }

    pub fn is_local(&self, key: &K) -> bool {
        self.owner(key) == self.world.rank()
    }

    fn route(&self, key: &K) -> Result<Rank> {
        let owner = self.owner(key);
        if owner >= self.world.size() {
            return Err(WorldError::PartitionMismatch {
                ranks: vec![self.world.rank()],
            });
        }
        Ok(owner)
    }

    // ============================================================
    // CORE OPERATIONS
    // ============================================================

    /// Stores `value` under `key`, replacing any previous value.
    pub fn replace(&self, key: K, value: V) -> Result<()> {
        let owner = self.route(&key)?;
        if owner == self.world.rank() {
            self.shard.insert(key, value);
            return Ok(());
        }

        tracing::trace!("REPLACE: forwarding to owner {}", owner);
        self.world
            .rmi()
            .post(owner, self.handlers.replace, &ReplaceRequest { key, value })
    }

    /// Removes `key`. Removing an absent key is not an error.
    pub fn erase(&self, key: K) -> Result<()> {
        let owner = self.route(&key)?;
        if owner == self.world.rank() {
            self.shard.remove(&key);
            return Ok(());
        }

        self.world
            .rmi()
            .post(owner, self.handlers.erase, &KeyRequest { key })
    }

    /// Looks `key` up. Local keys resolve immediately; remote keys take one
    /// round trip to the owner.
    pub fn find(&self, key: &K) -> Future<Option<V>> {
        let owner = match self.route(key) {
            Ok(owner) => owner,
            Err(err) => return Future::failed(err),
        };
        if owner == self.world.rank() {
            return Future::ready(self.get_local(key));
        }

        self.world.rmi().call(
            owner,
            self.handlers.find,
            &KeyRequest { key: key.clone() },
        )
    }

    /// Entries in this rank's shard.
    pub fn local_size(&self) -> usize {
        self.shard.len()
    }

    // ============================================================
    // LOCAL SHARD
    // ============================================================

    /// Whether this rank's shard holds `key`. Never communicates.
    pub fn probe(&self, key: &K) -> bool {
        self.shard.contains_key(key)
    }

    pub fn get_local(&self, key: &K) -> Option<V> {
        self.shard.get(key).map(|value| value.clone())
    }

    /// Visits every local entry. `f` must not modify this container.
    pub fn for_each_local(&self, mut f: impl FnMut(&K, &V)) {
        for entry in self.shard.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn local_entries(&self) -> Vec<(K, V)> {
        self.shard
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn clear_local(&self) {
        self.shard.clear();
    }

    // ============================================================
    // ITEM OPERATIONS
    // ============================================================

    /// Registers a named operation that runs on an item at its owner.
    ///
    /// The operation receives the key, the item (`None` if absent) and the
    /// argument; it may create, modify or remove the item. It runs under the
    /// item's entry lock and must not access this container.
    ///
    /// Every rank must register the same operations. Remote invocations are
    /// safe once all ranks have done so, e.g. after a fence.
    pub fn register_op<A, R, F>(&self, name: &str, dispatch: Dispatch, op: F) -> Result<()>
    where
        A: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
        F: Fn(&K, &mut Option<V>, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let id = register_op_handler(self.world.rmi(), self.id, name, dispatch, &self.shard, op)?;
        self.ops.insert(name.to_string(), id);
        Ok(())
    }

    fn op_id(&self, name: &str) -> Result<HandlerId> {
        self.ops
            .get(name)
            .map(|id| *id)
            .ok_or(WorldError::HandlerNotFound {
                id: HandlerId::from_name(&op_handler(self.id, name)),
                rank: self.world.rank(),
            })
    }

    /// Runs operation `name` on the item under `key` and returns its result.
    /// On the owner the operation runs on the calling thread.
    pub fn invoke<A, R>(&self, key: K, name: &str, arg: A) -> Future<R>
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let target = self
            .route(&key)
            .and_then(|owner| self.op_id(name).map(|id| (owner, id)));
        let (owner, id) = match target {
            Ok(target) => target,
            Err(err) => return Future::failed(err),
        };

        if owner == self.world.rank() {
            let result = InvokeRequest { key, arg }
                .encode()
                .and_then(|payload| self.invoke_local(id, &payload))
                .and_then(|bytes| R::decode(&bytes));
            return match result {
                Ok(value) => Future::ready(value),
                Err(err) => Future::failed(err),
            };
        }

        self.world.rmi().call(owner, id, &InvokeRequest { key, arg })
    }

    /// Like [`invoke`](Self::invoke) without waiting for a result. Failures
    /// are logged on the owner.
    pub fn invoke_detached<A>(&self, key: K, name: &str, arg: A) -> Result<()>
    where
        A: Serialize + DeserializeOwned,
    {
        let owner = self.route(&key)?;
        let id = self.op_id(name)?;
        let request = InvokeRequest { key, arg };

        if owner == self.world.rank() {
            if let Err(err) = self.invoke_local(id, &request.encode()?) {
                tracing::error!("Detached operation '{}' failed: {}", name, err);
            }
            return Ok(());
        }

        self.world.rmi().post(owner, id, &request)
    }

    /// Runs a registered operation's handler on the calling thread. Errors
    /// and panics come back as `RemoteHandler`, as they would from the owner.
    fn invoke_local(&self, id: HandlerId, payload: &[u8]) -> Result<Vec<u8>> {
        let entry = self.world.rmi().registry().lookup(id)?;
        let rank = self.world.rank();
        let message = match catch_unwind(AssertUnwindSafe(|| (entry.handler)(rank, payload))) {
            Ok(Ok(bytes)) => return Ok(bytes),
            Ok(Err(err)) => format!("{:#}", err),
            Err(payload) => panic_message(payload.as_ref()),
        };
        Err(WorldError::RemoteHandler {
            rank,
            handler: entry.name.to_string(),
            message,
        })
    }

    // ============================================================
    // CONSISTENCY AND LIFECYCLE
    // ============================================================

    /// Collectively checks that every rank maps `keys` to the same owners.
    ///
    /// # Errors
    ///
    /// `PartitionMismatch` naming the ranks that disagree with rank 0.
    pub fn verify_owners(&self, keys: &[K]) -> Result<()> {
        let mut owners = Vec::with_capacity(keys.len() * 8);
        for key in keys {
            owners.extend_from_slice(&(self.owner(key) as u64).to_le_bytes());
        }
        let digest = fnv1a_64(&owners);

        let table = self.world.collective().allgather(vec![digest])?;
        let ranks = disagreeing_ranks(&table);
        if ranks.is_empty() {
            Ok(())
        } else {
            Err(WorldError::PartitionMismatch { ranks })
        }
    }

    /// Unregisters the container's handlers and drops the local shard.
    ///
    /// Must be called on every rank after a fence, so no message for this
    /// container is still in flight. A container dropped without `destroy`
    /// keeps its handlers, and its shard, registered for late messages.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = self.world.rmi();
        engine.unregister(self.handlers.replace);
        engine.unregister(self.handlers.erase);
        engine.unregister(self.handlers.find);
        for op in self.ops.iter() {
            engine.unregister(*op.value());
        }
        self.ops.clear();
        self.shard.clear();

        tracing::debug!("Destroyed distributed map {} on rank {}", self.id, self.world.rank());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
