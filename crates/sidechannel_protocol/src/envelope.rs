//! Wire envelope for sidechannel frames.
//!
//! Every frame starts with a varint tag taken from a reserved *negative* range,
//! so it can never collide with the host protocol's own (non-negative) packet ids.
//! The payload of each tag is a fixed sequence of blocks:
//!
//! | tag | value | direction | payload |
//! |-----|-------|-----------|---------|
//! | `Instruction`   | -2 | server → client | `[message, sender]` |
//! | `ClientEvent`   | -3 | client → server | `[varint event id, params]` |
//! | `QueryRequest`  | -4 | server → client | `[uuid, query, sender]` |
//! | `QueryResponse` | -5 | client → server | `[uuid, value]` |
//!
//! Byte blocks are `varint length ++ bytes`; uuids are 16 raw bytes (big endian).
//! The blocks themselves are opaque here, decoding them is the codec's job.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Varints carry at most 32 bits, i.e. 5 groups of 7.
const MAX_VARINT_BYTES: usize = 5;

/// Which way a frame travels on the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ServerToClient,
    ClientToServer,
}

/// The reserved tag space. Values are fixed and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTag {
    Instruction,
    ClientEvent,
    QueryRequest,
    QueryResponse,
}

impl FrameTag {
    pub const ALL: [FrameTag; 4] = [
        FrameTag::Instruction,
        FrameTag::ClientEvent,
        FrameTag::QueryRequest,
        FrameTag::QueryResponse,
    ];

    pub const fn wire_id(self) -> i32 {
        match self {
            FrameTag::Instruction => -2,
            FrameTag::ClientEvent => -3,
            FrameTag::QueryRequest => -4,
            FrameTag::QueryResponse => -5,
        }
    }

    pub fn from_wire_id(id: i32) -> Option<Self> {
        match id {
            -2 => Some(FrameTag::Instruction),
            -3 => Some(FrameTag::ClientEvent),
            -4 => Some(FrameTag::QueryRequest),
            -5 => Some(FrameTag::QueryResponse),
            _ => None,
        }
    }

    pub const fn direction(self) -> Direction {
        match self {
            FrameTag::Instruction | FrameTag::QueryRequest => Direction::ServerToClient,
            FrameTag::ClientEvent | FrameTag::QueryResponse => Direction::ClientToServer,
        }
    }
}

/// Framing failures. These never leave the multiplexer: the frame is dropped
/// and the connection carries on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),

    #[error("varint is longer than 5 bytes")]
    VarIntTooLong,

    #[error("negative block length {0}")]
    NegativeLength(i32),

    #[error("block length {declared} exceeds the {remaining} bytes left in the frame")]
    Overlong { declared: usize, remaining: usize },

    #[error("tag {0} is not a sidechannel frame")]
    UnknownTag(i32),
}

/// One decoded sidechannel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Instruction {
        message: Bytes,
        sender: Bytes,
    },
    ClientEvent {
        event_id: i32,
        params: Bytes,
    },
    QueryRequest {
        request_id: Uuid,
        query: Bytes,
        sender: Bytes,
    },
    QueryResponse {
        request_id: Uuid,
        value: Bytes,
    },
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Instruction { .. } => FrameTag::Instruction,
            Frame::ClientEvent { .. } => FrameTag::ClientEvent,
            Frame::QueryRequest { .. } => FrameTag::QueryRequest,
            Frame::QueryResponse { .. } => FrameTag::QueryResponse,
        }
    }

    /// Serialize the frame, tag first, ready to be written as one host packet.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        write_var_int(&mut buf, self.tag().wire_id());
        match self {
            Frame::Instruction { message, sender } => {
                write_block(&mut buf, message);
                write_block(&mut buf, sender);
            }
            Frame::ClientEvent { event_id, params } => {
                write_var_int(&mut buf, *event_id);
                write_block(&mut buf, params);
            }
            Frame::QueryRequest { request_id, query, sender } => {
                write_uuid(&mut buf, request_id);
                write_block(&mut buf, query);
                write_block(&mut buf, sender);
            }
            Frame::QueryResponse { request_id, value } => {
                write_uuid(&mut buf, request_id);
                write_block(&mut buf, value);
            }
        }
        buf.freeze()
    }

    /// Decode the payload that follows an already consumed tag.
    pub fn decode_payload<B: Buf>(tag: FrameTag, buf: &mut B) -> Result<Frame, FrameError> {
        let frame = match tag {
            FrameTag::Instruction => Frame::Instruction {
                message: read_block(buf)?,
                sender: read_block(buf)?,
            },
            FrameTag::ClientEvent => Frame::ClientEvent {
                event_id: read_var_int(buf)?,
                params: read_block(buf)?,
            },
            FrameTag::QueryRequest => Frame::QueryRequest {
                request_id: read_uuid(buf)?,
                query: read_block(buf)?,
                sender: read_block(buf)?,
            },
            FrameTag::QueryResponse => Frame::QueryResponse {
                request_id: read_uuid(buf)?,
                value: read_block(buf)?,
            },
        };
        Ok(frame)
    }

    /// Decode a complete frame, tag included.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Frame, FrameError> {
        let id = read_var_int(buf)?;
        let tag = FrameTag::from_wire_id(id).ok_or(FrameError::UnknownTag(id))?;
        Self::decode_payload(tag, buf)
    }

    fn encoded_len_hint(&self) -> usize {
        let blocks = match self {
            Frame::Instruction { message, sender } => message.len() + sender.len(),
            Frame::ClientEvent { params, .. } => params.len(),
            Frame::QueryRequest { query, sender, .. } => 16 + query.len() + sender.len(),
            Frame::QueryResponse { value, .. } => 16 + value.len(),
        };
        blocks + 4 * MAX_VARINT_BYTES
    }
}

// -----------------------------------------------------------------------------
// Primitive readers / writers
// -----------------------------------------------------------------------------

/// Write a 32-bit LEB128 varint. Negative values are written as their
/// two's-complement bit pattern and always take five bytes.
pub fn write_var_int<B: BufMut>(buf: &mut B, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
}

pub fn read_var_int<B: Buf>(buf: &mut B) -> Result<i32, FrameError> {
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        if !buf.has_remaining() {
            return Err(FrameError::Truncated("varint"));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(FrameError::VarIntTooLong)
}

pub fn write_block<B: BufMut>(buf: &mut B, block: &[u8]) {
    write_var_int(buf, block.len() as i32);
    buf.put_slice(block);
}

pub fn read_block<B: Buf>(buf: &mut B) -> Result<Bytes, FrameError> {
    let len = read_var_int(buf)?;
    if len < 0 {
        return Err(FrameError::NegativeLength(len));
    }
    let len = len as usize;
    if len > buf.remaining() {
        return Err(FrameError::Overlong {
            declared: len,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn write_uuid<B: BufMut>(buf: &mut B, id: &Uuid) {
    buf.put_u128(id.as_u128());
}

pub fn read_uuid<B: Buf>(buf: &mut B) -> Result<Uuid, FrameError> {
    if buf.remaining() < 16 {
        return Err(FrameError::Truncated("uuid"));
    }
    Ok(Uuid::from_u128(buf.get_u128()))
}
