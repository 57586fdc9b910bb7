//! In-process process group.
//!
//! Every rank is a [`LocalGroup`] handle living on its own OS thread. Ranks are
//! connected by unbounded `crossbeam` channels, so a send never blocks and
//! messages from one sender keep their order.

use super::types::{ProcessGroup, Rank};
use crate::error::{Result, WorldError};

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::sync::{Arc, Barrier};

type Delivery = (Vec<u8>, Rank);

pub struct LocalGroup {
    rank: Rank,
    peers: Vec<Sender<Delivery>>,
    inbox: Receiver<Delivery>,
    barrier: Arc<Barrier>,
}

impl LocalGroup {
    /// Creates `size` connected handles; element `i` is rank `i`.
    pub fn create(size: usize) -> Vec<Arc<LocalGroup>> {
        assert!(size > 0, "a process group needs at least one rank");

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let barrier = Arc::new(Barrier::new(size));

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                Arc::new(LocalGroup {
                    rank,
                    peers: senders.clone(),
                    inbox,
                    barrier: barrier.clone(),
                })
            })
            .collect()
    }

    /// Buffers waiting to be received by this rank.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, target: Rank, bytes: Vec<u8>) -> Result<()> {
        let peer = self.peers.get(target).ok_or_else(|| WorldError::Transport {
            rank: self.rank,
            message: format!("no rank {} in a group of {}", target, self.peers.len()),
        })?;

        peer.send((bytes, self.rank))
            .map_err(|_| WorldError::Transport {
                rank: self.rank,
                message: format!("rank {} has left the group", target),
            })
    }

    fn try_receive(&self) -> Result<Option<(Vec<u8>, Rank)>> {
        match self.inbox.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WorldError::Transport {
                rank: self.rank,
                message: "inbox disconnected".to_string(),
            }),
        }
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}
