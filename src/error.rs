//! Runtime Error Taxonomy
//!
//! Every failure the runtime can observe is a [`WorldError`]. Only
//! [`WorldError::RemoteHandler`] is meant to be recovered by callers: it travels
//! back through the [`Future`](crate::executor::future::Future) of a
//! request/response call. The other variants describe a broken protocol
//! invariant (transport loss, codec bug, inconsistent registration, diverging
//! partition maps, a fence that never settles). Those are routed to [`fatal`]
//! because the process group is fail-stop and nothing above it could mask them.

use crate::group::types::Rank;
use crate::rmi::types::HandlerId;

use std::any::Any;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorldError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    /// The process group failed to send or receive.
    #[error("transport failure on rank {rank}: {message}")]
    Transport { rank: Rank, message: String },

    /// A value could not be encoded or decoded.
    #[error("encoding failure: {0}")]
    Encoding(String),

    /// An envelope arrived whose header does not describe its bytes.
    #[error("malformed envelope from rank {sender}: {reason}")]
    MalformedEnvelope { sender: Rank, reason: String },

    /// A message referenced a handler that this rank never registered.
    #[error("handler {id} is not registered on rank {rank}")]
    HandlerNotFound { id: HandlerId, rank: Rank },

    /// Two registrations map to the same handler id.
    #[error("handler {id} is already registered as '{existing}' (tried '{name}')")]
    DuplicateHandler {
        id: HandlerId,
        existing: String,
        name: String,
    },

    /// A handler returned an error (or panicked) on the remote rank.
    #[error("handler '{handler}' failed on rank {rank}: {message}")]
    RemoteHandler {
        rank: Rank,
        handler: String,
        message: String,
    },

    /// Ranks computed different owners for the same keys.
    #[error("partition map disagrees on ranks {ranks:?}")]
    PartitionMismatch { ranks: Vec<Rank> },

    /// Ranks registered different handler sets.
    #[error("handler registrations disagree on ranks {ranks:?}")]
    HandlerMismatch { ranks: Vec<Rank> },

    /// The fence did not reach quiescence within its round budget.
    #[error(
        "fence stalled after {rounds} rounds (sent={sent} processed={processed} \
         submitted={submitted} completed={completed}), busy ranks {ranks:?}"
    )]
    FenceStall {
        rounds: u64,
        sent: u64,
        processed: u64,
        submitted: u64,
        completed: u64,
        ranks: Vec<Rank>,
    },

    /// The producer of a future went away without writing it.
    #[error("promise dropped before a value was written")]
    BrokenPromise,

    /// Work was submitted after the thread pool stopped accepting it.
    #[error("thread pool is shut down")]
    PoolShutdown,
}

impl WorldError {
    /// Whether a caller may reasonably continue after seeing this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WorldError::RemoteHandler { .. })
    }
}

impl From<bincode::Error> for WorldError {
    fn from(err: bincode::Error) -> Self {
        WorldError::Encoding(err.to_string())
    }
}

/// Logs the diagnostic and aborts the process.
///
/// Used for protocol-layer failures, which the runtime cannot recover from.
pub fn fatal(err: &WorldError) -> ! {
    tracing::error!(error = %err, "fatal runtime error, aborting process");
    std::process::abort()
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
