//! Global fence.
//!
//! After a barrier, ranks repeatedly allgather their four monotonic counters:
//! messages sent and processed by the RMI engine, tasks submitted to and
//! completed by the pool. The fence ends once two consecutive rounds show the
//! same global sums with sent == processed and submitted == completed. A
//! single balanced round is not enough: counters are read rank by rank, so a
//! message can be sent after its sender was read and processed before its
//! receiver was. An idle fence therefore takes two rounds.
//!
//! Every rank sees the same gathered table and so leaves in the same round.

use super::collective::Collective;
use crate::error::{Result, WorldError};
use crate::executor::pool::ThreadPool;
use crate::group::types::{ProcessGroup, Rank};
use crate::rmi::engine::RmiEngine;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_micros(100);

/// One rank's (or the whole group's) quiescence counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuiescenceCounts {
    pub sent: u64,
    pub processed: u64,
    pub submitted: u64,
    pub completed: u64,
}

impl QuiescenceCounts {
    /// Reads the counters of this rank. Completion counters are read first,
    /// so a snapshot never shows more completed than started work.
    pub fn local(engine: &RmiEngine, pool: &ThreadPool) -> Self {
        let pool_stats = pool.stats();
        let rmi_stats = engine.stats();
        Self {
            sent: rmi_stats.sent,
            processed: rmi_stats.processed,
            submitted: pool_stats.submitted,
            completed: pool_stats.completed,
        }
    }

    pub fn to_vec(self) -> Vec<u64> {
        vec![self.sent, self.processed, self.submitted, self.completed]
    }

    pub fn from_slice(values: &[u64]) -> Self {
        let at = |i: usize| values.get(i).copied().unwrap_or(0);
        Self {
            sent: at(0),
            processed: at(1),
            submitted: at(2),
            completed: at(3),
        }
    }

    pub fn total<'a>(counts: impl IntoIterator<Item = &'a QuiescenceCounts>) -> Self {
        counts.into_iter().fold(Self::default(), |acc, c| Self {
            sent: acc.sent + c.sent,
            processed: acc.processed + c.processed,
            submitted: acc.submitted + c.submitted,
            completed: acc.completed + c.completed,
        })
    }

    /// No message or task is in flight according to these counts.
    pub fn is_balanced(&self) -> bool {
        self.sent == self.processed && self.submitted == self.completed
    }
}

/// Outcome of a successful fence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FenceReport {
    /// Fences completed on this rank so far, this one included.
    pub epoch: u64,
    /// Exchange rounds this fence took.
    pub rounds: u64,
}

pub struct Fence {
    group: Arc<dyn ProcessGroup>,
    engine: Arc<RmiEngine>,
    pool: Arc<ThreadPool>,
    collective: Arc<Collective>,
    max_rounds: u64,
    backoff_max: Duration,
    epoch: AtomicU64,
}

impl Fence {
    pub fn new(
        group: Arc<dyn ProcessGroup>,
        engine: Arc<RmiEngine>,
        pool: Arc<ThreadPool>,
        collective: Arc<Collective>,
        max_rounds: u64,
        backoff_max: Duration,
    ) -> Self {
        Self {
            group,
            engine,
            pool,
            collective,
            max_rounds: max_rounds.max(2),
            backoff_max,
            epoch: AtomicU64::new(0),
        }
    }

    /// Blocks until every message and task issued anywhere before the call
    /// has completed. Collective: every rank must call it.
    ///
    /// Must not be called from a handler or a pool task.
    ///
    /// # Errors
    ///
    /// `FenceStall` when the counters have not settled after the configured
    /// number of rounds; transport errors from the barrier or the exchange.
    pub fn try_fence(&self) -> Result<FenceReport> {
        self.group.barrier()?;

        let mut previous: Option<QuiescenceCounts> = None;
        let mut previous_ranks: Vec<QuiescenceCounts> = Vec::new();
        let mut backoff = INITIAL_BACKOFF;
        let mut last_ranks: Vec<QuiescenceCounts> = Vec::new();
        let mut last_total = QuiescenceCounts::default();

        for round in 1..=self.max_rounds {
            let local = QuiescenceCounts::local(&self.engine, &self.pool);
            let table = self.collective.allgather(local.to_vec())?;
            let ranks: Vec<QuiescenceCounts> = table
                .iter()
                .map(|values| QuiescenceCounts::from_slice(values))
                .collect();
            let total = QuiescenceCounts::total(&ranks);

            tracing::trace!(
                "Fence round {}: sent={} processed={} submitted={} completed={}",
                round,
                total.sent,
                total.processed,
                total.submitted,
                total.completed
            );

            if total.is_balanced() && previous == Some(total) {
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!("Fence epoch {} completed in {} rounds", epoch, round);
                return Ok(FenceReport {
                    epoch,
                    rounds: round,
                });
            }

            if !total.is_balanced() {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(self.backoff_max.max(INITIAL_BACKOFF));
            }

            previous = Some(total);
            previous_ranks = std::mem::replace(&mut last_ranks, ranks);
            last_total = total;
        }

        let err = WorldError::FenceStall {
            rounds: self.max_rounds,
            sent: last_total.sent,
            processed: last_total.processed,
            submitted: last_total.submitted,
            completed: last_total.completed,
            ranks: busy_ranks(&previous_ranks, &last_ranks),
        };
        tracing::error!("{}", err);
        Err(err)
    }

    /// Fences completed on this rank.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Ranks with queued or running tasks, or whose counters still moved in the
/// last round. All ranks when neither singles anyone out.
pub fn busy_ranks(previous: &[QuiescenceCounts], last: &[QuiescenceCounts]) -> Vec<Rank> {
    let busy: Vec<Rank> = last
        .iter()
        .enumerate()
        .filter(|(rank, counts)| {
            counts.submitted != counts.completed || previous.get(*rank) != Some(*counts)
        })
        .map(|(rank, _)| rank)
        .collect();

    if busy.is_empty() {
        (0..last.len()).collect()
    } else {
        busy
    }
}
