//! Payload codec.
//!
//! Every argument, result and stored item crosses the wire through [`Codec`].
//! Any `serde` type gets it for free via `bincode` with fixed-width integers,
//! so the byte layout does not depend on the values being encoded.

use crate::error::{Result, WorldError};

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub trait Codec: Sized {
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decodes exactly one value; unread trailing bytes are an error.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl<T> Codec for T
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self) -> Result<Vec<u8>> {
        options()
            .serialize(self)
            .map_err(|e| WorldError::Encoding(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        options()
            .deserialize(bytes)
            .map_err(|e| WorldError::Encoding(e.to_string()))
    }
}
