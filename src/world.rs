//! The per-process runtime context.
//!
//! A [`World`] is built once per rank at startup and handed to every
//! component that needs the runtime: it owns the thread pool, the RMI engine
//! and its poller, the collectives and the fence. Nothing in the crate is a
//! global; two worlds can coexist in one process (the test-suite runs one per
//! thread).

use crate::config::RuntimeConfig;
use crate::error::{Result, WorldError, fatal};
use crate::executor::pool::ThreadPool;
use crate::fence::collective::Collective;
use crate::fence::quiescence::{Fence, FenceReport};
use crate::group::types::{ProcessGroup, Rank};
use crate::rmi::engine::RmiEngine;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct World {
    group: Arc<dyn ProcessGroup>,
    config: RuntimeConfig,
    pool: Arc<ThreadPool>,
    engine: Arc<RmiEngine>,
    collective: Arc<Collective>,
    fence: Fence,
    next_container: AtomicU64,
    shut_down: AtomicBool,
}

impl World {
    /// Builds the runtime for this rank and starts its poller.
    ///
    /// Collective: returns once every rank's poller is running, so messages
    /// may be sent as soon as it returns.
    pub fn new(group: Arc<dyn ProcessGroup>, config: RuntimeConfig) -> Result<Arc<Self>> {
        let rank = group.rank();
        let pool = ThreadPool::with_name(format!("rank{}", rank), config.worker_count);
        let engine = RmiEngine::new(group.clone(), pool.clone(), &config);
        let collective = Collective::new(engine.clone());
        let fence = Fence::new(
            group.clone(),
            engine.clone(),
            pool.clone(),
            collective.clone(),
            config.fence_max_rounds,
            config.fence_backoff_max(),
        );

        engine.start();
        group.barrier()?;

        tracing::info!(
            "World rank {}/{} ready with {} workers",
            rank,
            group.size(),
            pool.worker_count()
        );

        Ok(Arc::new(Self {
            group,
            config,
            pool,
            engine,
            collective,
            fence,
            next_container: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn rmi(&self) -> &Arc<RmiEngine> {
        &self.engine
    }

    pub fn collective(&self) -> &Arc<Collective> {
        &self.collective
    }

    /// Blocks until every message and task issued by any rank before the call
    /// has completed everywhere. Aborts the process if the fence stalls.
    pub fn fence(&self) -> FenceReport {
        self.try_fence().unwrap_or_else(|err| fatal(&err))
    }

    /// Like [`fence`](Self::fence) but hands the failure to the caller.
    pub fn try_fence(&self) -> Result<FenceReport> {
        self.fence.try_fence()
    }

    /// Fences completed so far.
    pub fn epoch(&self) -> u64 {
        self.fence.epoch()
    }

    /// Collectively checks that every rank registered the same handlers.
    ///
    /// # Errors
    ///
    /// `HandlerMismatch` naming the ranks whose handler set differs from
    /// rank 0's.
    pub fn verify_handlers(&self) -> Result<()> {
        let digest = self.engine.registry().digest();
        let table = self.collective.allgather(vec![digest])?;
        let ranks = disagreeing_ranks(&table);

        if ranks.is_empty() {
            Ok(())
        } else {
            Err(WorldError::HandlerMismatch { ranks })
        }
    }

    /// Allocates the id of the next distributed container. Containers must be
    /// created in the same order on every rank.
    pub fn next_container_id(&self) -> u64 {
        self.next_container.fetch_add(1, Ordering::SeqCst)
    }

    /// Fences, stops the poller, drains the pool and meets the other ranks at
    /// a final barrier. Collective. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.try_fence()?;
        self.engine.stop();
        self.pool.shutdown();
        self.group.barrier()?;

        tracing::info!("World rank {} shut down after {} fences", self.rank(), self.epoch());
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            tracing::warn!("World rank {} dropped without shutdown", self.rank());
            self.engine.stop();
            self.pool.shutdown();
        }
    }
}

/// Ranks whose row differs from rank 0's.
pub(crate) fn disagreeing_ranks(table: &[Vec<u64>]) -> Vec<Rank> {
    let Some(reference) = table.first() else {
        return Vec::new();
    };
    table
        .iter()
        .enumerate()
        .filter(|(_, row)| *row != reference)
        .map(|(rank, _)| rank)
        .collect()
}
