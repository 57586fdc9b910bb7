//! Remote Method Invocation Module
//!
//! Active messages between ranks: a sender names a handler by [`HandlerId`]
//! and ships encoded arguments; the receiving rank's poller runs the handler
//! and, for requests, sends the encoded result back under the request's
//! correlation tag.
//!
//! ## Submodules
//! - **`engine`**: the poller, dispatch and the send/call API.
//! - **`registry`**: name-derived handler ids mapped to closures.
//! - **`protocol`**: envelope wire format and reply bodies.
//! - **`codec`**: the `Codec` trait used for every payload.
//! - **`types`**: handler ids, dispatch policy and statistics.

pub mod codec;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod types;
