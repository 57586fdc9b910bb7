//! Gather-at-root collectives.
//!
//! Every rank sends its contribution to rank 0 under
//! [`HandlerId::COLLECTIVE_CONTRIBUTE`]. Once rank 0 holds all of them for a
//! sequence number it broadcasts the full table under
//! [`HandlerId::COLLECTIVE_RESULT`]. Both handlers are system handlers: they
//! run inline on the poller and are invisible to the fence counters.
//!
//! Collectives are matched by per-rank sequence numbers, so every rank must
//! issue them in the same order, from one application thread at a time.

use crate::error::{Result, WorldError};
use crate::group::types::Rank;
use crate::rmi::codec::Codec;
use crate::rmi::engine::{RmiEngine, SystemFn};
use crate::rmi::types::HandlerId;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How often a blocked collective asks the process group whether a peer died.
const PEER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contribution {
    pub seq: u64,
    pub values: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gathered {
    pub seq: u64,
    /// Contributions indexed by rank.
    pub values: Vec<Vec<u64>>,
}

#[derive(Default)]
struct GatherState {
    /// Rank 0 only: partial tables by sequence number.
    contributions: HashMap<u64, Vec<Option<Vec<u64>>>>,
    /// Broadcast tables not yet claimed by `allgather`.
    results: HashMap<u64, Vec<Vec<u64>>>,
}

struct Shared {
    size: usize,
    state: Mutex<GatherState>,
    result_ready: Condvar,
}

pub struct Collective {
    engine: Arc<RmiEngine>,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
}

impl Collective {
    /// Installs the collective handlers on `engine`. Must run before the
    /// engine's poller starts.
    pub fn new(engine: Arc<RmiEngine>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            size: engine.size(),
            state: Mutex::new(GatherState::default()),
            result_ready: Condvar::new(),
        });

        let contribute: SystemFn = {
            let shared = shared.clone();
            let engine = Arc::downgrade(&engine);
            Arc::new(move |from: Rank, bytes: &[u8]| on_contribution(&shared, &engine, from, bytes))
        };
        let result: SystemFn = {
            let shared = shared.clone();
            Arc::new(move |_: Rank, bytes: &[u8]| on_result(&shared, bytes))
        };
        engine.register_system(HandlerId::COLLECTIVE_CONTRIBUTE, contribute);
        engine.register_system(HandlerId::COLLECTIVE_RESULT, result);

        Arc::new(Self {
            engine,
            shared,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Returns every rank's `values`, indexed by rank. Blocks until all ranks
    /// have contributed.
    ///
    /// # Errors
    ///
    /// `Transport` if the process group reports a lost peer while waiting.
    pub fn allgather(&self, values: Vec<u64>) -> Result<Vec<Vec<u64>>> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let contribution = Contribution { seq, values };
        self.engine
            .send_system(0, HandlerId::COLLECTIVE_CONTRIBUTE, contribution.encode()?)?;

        let mut state = self.shared.state.lock();
        loop {
            if let Some(table) = state.results.remove(&seq) {
                return Ok(table);
            }
            if self
                .shared
                .result_ready
                .wait_for(&mut state, PEER_CHECK_INTERVAL)
                .timed_out()
            {
                self.engine.check_peers()?;
            }
        }
    }

    /// Element-wise wrapping sum of every rank's `values`. Shorter
    /// contributions count as zero-padded.
    pub fn allreduce_sum(&self, values: Vec<u64>) -> Result<Vec<u64>> {
        let table = self.allgather(values)?;
        let width = table.iter().map(Vec::len).max().unwrap_or(0);

        let mut sums = vec![0u64; width];
        for row in &table {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum = sum.wrapping_add(*value);
            }
        }
        Ok(sums)
    }
}

fn on_contribution(
    shared: &Shared,
    engine: &Weak<RmiEngine>,
    from: Rank,
    bytes: &[u8],
) -> Result<()> {
    let Contribution { seq, values } = Contribution::decode(bytes)?;

    let complete = {
        let mut state = shared.state.lock();
        let table = state
            .contributions
            .entry(seq)
            .or_insert_with(|| vec![None; shared.size]);
        let slot = table.get_mut(from).ok_or_else(|| WorldError::MalformedEnvelope {
            sender: from,
            reason: format!("contribution from rank outside a group of {}", shared.size),
        })?;
        if slot.replace(values).is_some() {
            return Err(WorldError::MalformedEnvelope {
                sender: from,
                reason: format!("second contribution to collective {}", seq),
            });
        }

        if table.iter().all(Option::is_some) {
            state
                .contributions
                .remove(&seq)
                .map(|table| table.into_iter().flatten().collect::<Vec<_>>())
        } else {
            None
        }
    };

    let Some(values) = complete else {
        return Ok(());
    };
    let Some(engine) = engine.upgrade() else {
        return Ok(());
    };

    tracing::trace!("Collective {} complete, broadcasting", seq);
    let payload = Gathered { seq, values }.encode()?;
    for rank in 0..shared.size {
        engine.send_system(rank, HandlerId::COLLECTIVE_RESULT, payload.clone())?;
    }
    Ok(())
}

fn on_result(shared: &Shared, bytes: &[u8]) -> Result<()> {
    let Gathered { seq, values } = Gathered::decode(bytes)?;
    shared.state.lock().results.insert(seq, values);
    shared.result_ready.notify_all();
    Ok(())
}
