//! Process Group Module
//!
//! The fixed set of ranked participants the runtime runs on. The runtime only
//! consumes the [`ProcessGroup`](types::ProcessGroup) trait; this module also
//! ships the two transports the crate uses itself.
//!
//! ## Guarantees a transport must give
//! - **Per-channel FIFO**: bytes sent from rank A to rank B are received by B in send order.
//! - **Self-send**: a rank may send to itself.
//! - **Fail-stop**: any send/receive failure is reported as `WorldError::Transport`
//!   and is treated as fatal by the runtime. There is no retry.
//!
//! ## Submodules
//! - **`types`**: `Rank` and the `ProcessGroup` trait.
//! - **`local`**: N ranks inside one OS process, one thread per rank (tests, `--local`).
//! - **`tcp`**: one rank per OS process over dedicated TCP connections.

pub mod local;
pub mod tcp;
pub mod types;
