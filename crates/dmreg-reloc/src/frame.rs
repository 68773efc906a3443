//! Message framing for the cross-boundary channel.
//!
//! Layout:
//! [ magic: u32 ][ version: u16 ][ kind: u8 ][ reserved: u8 ]
//! [ payload_len: u64 ][ base: u64 ][ checksum: 32 bytes ]
//! [ payload bytes … ]
//!
//! `base` is the address the sender laid the payload out at; the receiver
//! rebases from it. For `QueryContinue` it is the base of the tuple chain
//! that follows the flat continue header. The blake3 checksum covers the
//! header, checksum field zeroed, followed by the payload.

use serde::{Deserialize, Serialize};

use dmreg_core::error::{Error, ErrorKind, Result};

use crate::cursor::{Reader, Writer};

pub const MAGIC: u32 = 0x4752_4D44; // "DMRG"
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 8 + 8 + 32;
const CHECKSUM_AT: usize = HEADER_LEN - 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    SchemaAdd = 0,
    SchemaDelete = 1,
    SchemaSnapshot = 2,
    QueryAdd = 3,
    QueryDelete = 4,
    QueryContinue = 5,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MessageKind::SchemaAdd,
            1 => MessageKind::SchemaDelete,
            2 => MessageKind::SchemaSnapshot,
            3 => MessageKind::QueryAdd,
            4 => MessageKind::QueryDelete,
            5 => MessageKind::QueryContinue,
            _ => return Err(Error::at(ErrorKind::BadBlock, "unknown message kind")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub base: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, base: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            base,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(0, HEADER_LEN + self.payload.len());
        w.put_u32(MAGIC);
        w.put_bytes(&VERSION.to_le_bytes());
        w.put_u8(self.kind as u8);
        w.put_u8(0); // reserved
        w.put_u64(self.payload.len() as u64);
        w.put_u64(self.base);
        w.reserve(32);
        w.put_bytes(&self.payload);
        // checksum slot is still zero here
        let sum = checksum(w.as_slice());
        w.set_bytes(CHECKSUM_AT, &sum);
        w.into_inner()
    }

    /// Parse and verify a frame. Payloads above `max_payload` are refused
    /// before anything is copied.
    pub fn decode(bytes: &[u8], max_payload: usize) -> Result<Self> {
        let r = Reader::new(bytes, 0);
        if r.len() < HEADER_LEN {
            return Err(Error::at(ErrorKind::BadBlock, "short frame header"));
        }
        let magic = r.u32(0)?;
        let v = r.bytes(4, 2)?;
        let version = u16::from_le_bytes([v[0], v[1]]);
        if magic != MAGIC || version != VERSION {
            return Err(Error::at(ErrorKind::BadBlock, "bad magic/version"));
        }
        let kind = MessageKind::from_u8(r.u8(6)?)?;
        let payload_len = r.u64(8)?;
        if payload_len > max_payload as u64 {
            return Err(Error::at(
                ErrorKind::BadBlock,
                format!("payload of {payload_len} bytes exceeds max {max_payload}"),
            ));
        }
        if bytes.len() as u64 != HEADER_LEN as u64 + payload_len {
            return Err(Error::at(ErrorKind::BadBlock, "frame length mismatch"));
        }
        let base = r.u64(16)?;
        let stored = r.bytes(CHECKSUM_AT, 32)?;

        let mut scratch = bytes.to_vec();
        scratch[CHECKSUM_AT..HEADER_LEN].fill(0);
        if checksum(&scratch) != stored {
            return Err(Error::at(ErrorKind::BadBlock, "checksum mismatch"));
        }
        Ok(Self {
            kind,
            base,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

fn checksum(bytes: &[u8]) -> [u8; 32] {
    dmreg_core::hash::hash_bytes(bytes).0
}
