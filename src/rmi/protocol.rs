//! Active-message wire format.
//!
//! Envelope format: `[handler:4][length:4][sender:4][tag:8]?[payload:N]`
//!
//! - **handler**: [`HandlerId`] (little-endian u32). The top bit
//!   ([`RESPONSE_FLAG`]) is set when the envelope carries a correlation tag.
//! - **length**: payload size in bytes (little-endian u32)
//! - **sender**: rank that built the envelope (little-endian u32)
//! - **tag**: correlation tag (little-endian u64), present on requests that
//!   expect a reply and on the replies themselves
//! - **payload**: handler arguments, encoded by the caller

use super::types::HandlerId;
use crate::error::{Result, WorldError};
use crate::group::types::Rank;

use serde::{Deserialize, Serialize};

/// Header size without a correlation tag: 4 + 4 + 4 = 12 bytes.
pub const BASE_HEADER_SIZE: usize = 12;

/// Header size with a correlation tag: 12 + 8 = 20 bytes.
pub const TAGGED_HEADER_SIZE: usize = 20;

/// Largest payload an envelope may carry; a tagged envelope then still fits
/// in one TCP frame.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024 - TAGGED_HEADER_SIZE;

/// Marks a tagged envelope in the handler field.
pub const RESPONSE_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub handler: HandlerId,
    pub sender: Rank,
    pub tag: Option<u64>,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// # Errors
    ///
    /// `Encoding` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WorldError::Encoding(format!(
                "payload of {} bytes for handler {} exceeds limit {}",
                self.payload.len(),
                self.handler,
                MAX_PAYLOAD_SIZE
            )));
        }

        let header_size = if self.tag.is_some() {
            TAGGED_HEADER_SIZE
        } else {
            BASE_HEADER_SIZE
        };
        let handler = match self.tag {
            Some(_) => self.handler.0 | RESPONSE_FLAG,
            None => self.handler.0,
        };

        let mut bytes = Vec::with_capacity(header_size + self.payload.len());
        bytes.extend_from_slice(&handler.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.sender as u32).to_le_bytes());
        if let Some(tag) = self.tag {
            bytes.extend_from_slice(&tag.to_le_bytes());
        }
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parses one envelope delivered by the process group from rank `from`.
    ///
    /// # Errors
    ///
    /// `MalformedEnvelope` if the buffer is shorter than its header, the
    /// length field disagrees with the bytes present, or the sender field does
    /// not name the rank the transport delivered it from.
    pub fn decode(bytes: &[u8], from: Rank) -> Result<Self> {
        let malformed = |reason: String| WorldError::MalformedEnvelope {
            sender: from,
            reason,
        };

        if bytes.len() < BASE_HEADER_SIZE {
            return Err(malformed(format!(
                "need {} header bytes, have {}",
                BASE_HEADER_SIZE,
                bytes.len()
            )));
        }

        let raw_handler = read_u32(bytes, 0);
        let length = read_u32(bytes, 4) as usize;
        let sender = read_u32(bytes, 8) as Rank;

        let tagged = raw_handler & RESPONSE_FLAG != 0;
        let header_size = if tagged {
            TAGGED_HEADER_SIZE
        } else {
            BASE_HEADER_SIZE
        };
        if bytes.len() < header_size {
            return Err(malformed(format!(
                "need {} header bytes, have {}",
                header_size,
                bytes.len()
            )));
        }
        if bytes.len() - header_size != length {
            return Err(malformed(format!(
                "length field says {} payload bytes, have {}",
                length,
                bytes.len() - header_size
            )));
        }
        if sender != from {
            return Err(malformed(format!("sender field names rank {}", sender)));
        }

        let tag = tagged.then(|| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[BASE_HEADER_SIZE..TAGGED_HEADER_SIZE]);
            u64::from_le_bytes(raw)
        });

        Ok(Self {
            handler: HandlerId(raw_handler & !RESPONSE_FLAG),
            sender,
            tag,
            payload: bytes[header_size..].to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Payload of a [`HandlerId::REPLY`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplyBody {
    /// Encoded handler result.
    Ok(Vec<u8>),
    /// The handler failed or panicked.
    Err { handler: String, message: String },
}
