use crate::error::Result;

/// Identity of a participant, `0..size`. Fixed for the lifetime of the process.
pub type Rank = usize;

/// A fixed group of ranked processes with point-to-point messaging and a barrier.
///
/// Implementations are shared between the dispatch loop (which polls
/// `try_receive`), application threads and worker threads (which `send`), so
/// every method takes `&self`.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Queues `bytes` for delivery to `target`. Never blocks on the receiver.
    fn send(&self, target: Rank, bytes: Vec<u8>) -> Result<()>;

    /// Returns the next arrived buffer and its sender, if any.
    fn try_receive(&self) -> Result<Option<(Vec<u8>, Rank)>>;

    /// Blocks until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Fails once some peer is known to be gone, so that waits on other
    /// ranks can give up instead of hanging.
    fn check_peers(&self) -> Result<()> {
        Ok(())
    }
}
