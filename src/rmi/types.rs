use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a message handler.
///
/// Computed from the handler's name, so every rank derives the same id without
/// coordination. Ids at or above [`HandlerId::RESERVED_BASE`] belong to the
/// runtime itself. The top bit never appears in an id; on the wire it marks an
/// envelope that carries a correlation tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl HandlerId {
    /// First id of the range reserved for runtime protocol messages.
    pub const RESERVED_BASE: u32 = 0x7FFF_FF00;

    /// Response to a tagged request.
    pub const REPLY: HandlerId = HandlerId(Self::RESERVED_BASE);
    /// A rank's contribution to a collective, sent to rank 0.
    pub const COLLECTIVE_CONTRIBUTE: HandlerId = HandlerId(Self::RESERVED_BASE + 1);
    /// Rank 0's broadcast of a gathered collective.
    pub const COLLECTIVE_RESULT: HandlerId = HandlerId(Self::RESERVED_BASE + 2);

    const ID_MASK: u32 = 0x7FFF_FFFF;

    /// Derives the id of a user-level handler from its name.
    pub fn from_name(name: &str) -> Self {
        let mut id = fnv1a_32(name.as_bytes()) & Self::ID_MASK;
        if id >= Self::RESERVED_BASE {
            id -= 0x100;
        }
        HandlerId(id)
    }

    /// Whether the id lies in the runtime's reserved range.
    pub fn is_system(self) -> bool {
        self.0 >= Self::RESERVED_BASE
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Where a handler runs once its envelope has been decoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Dispatch {
    /// On the poller thread, before the next envelope is decoded. Cheap,
    /// non-blocking handlers only; they must never wait on a future.
    #[default]
    Inline,
    /// On a pool worker.
    Pool,
}

/// Snapshot of the engine's message counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RmiStats {
    /// Counted envelopes sent, replies included.
    pub sent: u64,
    /// Counted envelopes whose handler has finished.
    pub processed: u64,
    /// Handlers run on the poller.
    pub inline: u64,
    /// Handlers handed to the pool.
    pub pooled: u64,
    /// Replies matched to a pending request.
    pub replies: u64,
}

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 32-bit FNV-1a.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV32_PRIME)
    })
}

/// 64-bit FNV-1a. Used for digests that must agree across processes, which
/// rules out `DefaultHasher`'s unspecified algorithm.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV64_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV64_PRIME)
    })
}
