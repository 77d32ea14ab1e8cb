// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! TCP wire framing.
//!
//! Every message on a TCP handle is prefixed by a fixed 12-byte header,
//! all fields big-endian:
//!
//! ```text
//! offset 0 : u32 magic   = 0xA5A5A5A5
//! offset 4 : u32 version = 0x00000001
//! offset 8 : u32 payload length
//! ```
//!
//! A header with the wrong magic is unrecoverable: the reader cannot find
//! the next frame boundary, so the handle is closed with
//! `RecvInvalidData`.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

use crate::error::MsgError;

pub const FRAME_HEADER_LEN: usize = 12;
pub const FRAME_MAGIC: u32 = 0xA5A5_A5A5;
pub const FRAME_VERSION: u32 = 0x0000_0001;

/// The fixed frame prefix.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    pub magic: U32<BigEndian>,
    pub version: U32<BigEndian>,
    pub length: U32<BigEndian>,
}

impl FrameHeader {
    pub fn for_payload(len: usize) -> Self {
        Self {
            magic: U32::new(FRAME_MAGIC),
            version: U32::new(FRAME_VERSION),
            length: U32::new(len as u32),
        }
    }

    /// Validates a received prefix and returns the declared payload
    /// length. `max_payload` is the receive-buffer cap.
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN], max_payload: usize) -> Result<usize, MsgError> {
        let hdr = Self::read_from_bytes(&buf[..]).map_err(|_| MsgError::RecvInvalidData)?;
        if hdr.magic.get() != FRAME_MAGIC {
            return Err(MsgError::RecvInvalidData);
        }
        let len = hdr.length.get() as usize;
        if len > max_payload {
            return Err(MsgError::RecvBuffNotEnough);
        }
        Ok(len)
    }
}

/// Frames `payload` for the wire: header followed by the payload bytes.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.put_slice(FrameHeader::for_payload(payload.len()).as_bytes());
    out.put_slice(payload);
    out.freeze()
}

/// Frames scattered fragments as if they had been concatenated.
pub fn encode_frame_vectored(frags: &[&[u8]]) -> Bytes {
    let total: usize = frags.iter().map(|f| f.len()).sum();
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + total);
    out.put_slice(FrameHeader::for_payload(total).as_bytes());
    for f in frags {
        out.put_slice(f);
    }
    out.freeze()
}
