// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! The compact default codec: fixed big-endian fields, length-prefixed
//! strings.
//!
//! Head layout:
//!
//! ```text
//! offset 0  : u8  version
//! offset 1  : u8  message type
//! offset 2  : u64 BE session id
//! offset 10 : u16 BE function-name length
//! offset 12 : function-name bytes (UTF-8)
//! ```
//!
//! Exception body: `i32 BE error code`, `u16 BE message length`, message
//! bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    codec::{CodecKind, HeadCodec, MsgType, RpcException, RpcHead},
    error::RpcError,
};

const HEAD_FIXED_LEN: usize = 12;
const EXCEPTION_FIXED_LEN: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl HeadCodec for BinaryCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Binary
    }

    fn encode_head(&self, head: &RpcHead, out: &mut BytesMut) -> Result<(), RpcError> {
        let name = head.function_name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(RpcError::EncodeFailed);
        }
        out.reserve(HEAD_FIXED_LEN + name.len());
        out.put_u8(head.version);
        out.put_u8(head.msg_type as u8);
        out.put_u64(head.session_id);
        out.put_u16(name.len() as u16);
        out.put_slice(name);
        Ok(())
    }

    fn decode_head(&self, buf: &[u8]) -> Result<(RpcHead, usize), RpcError> {
        if buf.len() < HEAD_FIXED_LEN {
            return Err(RpcError::DecodeFailed);
        }
        let mut cur = buf;
        let version = cur.get_u8();
        let msg_type = MsgType::try_from(cur.get_u8())?;
        let session_id = cur.get_u64();
        let name_len = cur.get_u16() as usize;
        if cur.remaining() < name_len {
            return Err(RpcError::DecodeFailed);
        }
        let function_name = std::str::from_utf8(&cur[..name_len])
            .map_err(|_| RpcError::DecodeFailed)?
            .to_string();
        Ok((
            RpcHead { version, msg_type, session_id, function_name },
            HEAD_FIXED_LEN + name_len,
        ))
    }

    fn encode_exception(&self, ex: &RpcException, out: &mut BytesMut) -> Result<(), RpcError> {
        let msg = ex.message.as_bytes();
        if msg.len() > u16::MAX as usize {
            return Err(RpcError::EncodeFailed);
        }
        out.reserve(EXCEPTION_FIXED_LEN + msg.len());
        out.put_i32(ex.error_code);
        out.put_u16(msg.len() as u16);
        out.put_slice(msg);
        Ok(())
    }

    fn decode_exception(&self, buf: &[u8]) -> Result<RpcException, RpcError> {
        if buf.len() < EXCEPTION_FIXED_LEN {
            return Err(RpcError::DecodeFailed);
        }
        let mut cur = buf;
        let error_code = cur.get_i32();
        let msg_len = cur.get_u16() as usize;
        if cur.remaining() < msg_len {
            return Err(RpcError::DecodeFailed);
        }
        let message = std::str::from_utf8(&cur[..msg_len])
            .map_err(|_| RpcError::DecodeFailed)?
            .to_string();
        Ok(RpcException { error_code, message })
    }
}
