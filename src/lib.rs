//! Distributed Object Runtime Library
//!
//! A fixed group of ranked processes sharing keyed data structures and
//! invoking operations on remote items through active messages. This crate
//! is the runtime layer; the binary (`main.rs`) runs a small end-to-end
//! scenario on top of it.
//!
//! ## Architecture Modules
//! The runtime is composed of loosely coupled subsystems, wired together by a
//! per-process [`World`](world::World):
//!
//! - **`group`**: The process group. Ranked point-to-point byte transport with
//!   a barrier, in-process (`LocalGroup`) or over TCP (`TcpGroup`).
//! - **`executor`**: The local thread pool and the single-assignment futures
//!   every asynchronous result is delivered through.
//! - **`rmi`**: The active-message engine. A poller thread decodes envelopes
//!   and runs registered handlers inline or on the pool; callers send
//!   fire-and-forget messages or requests with a future reply.
//! - **`fence`**: Collectives and the global fence that waits until every
//!   message and task issued before it has completed on every rank.
//! - **`storage`**: The distributed associative container (`DistributedMap`),
//!   sharded across ranks by a partition function.
//! - **`config`** / **`error`**: Runtime tunables and the error taxonomy.

pub mod config;
pub mod error;
pub mod executor;
pub mod fence;
pub mod group;
pub mod rmi;
pub mod storage;
pub mod world;
