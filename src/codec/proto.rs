// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Protobuf codec via `prost` derive; no schema-compilation step. The
//! head travels length-delimited so the decoder learns the payload
//! boundary from the varint prefix.

use bytes::BytesMut;
use prost::Message;

use crate::{
    codec::{CodecKind, HeadCodec, MsgType, RpcException, RpcHead},
    error::RpcError,
};

#[derive(Clone, PartialEq, Message)]
struct PbHead {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(uint32, tag = "2")]
    msg_type: u32,
    #[prost(uint64, tag = "3")]
    session_id: u64,
    #[prost(string, tag = "4")]
    function_name: String,
}

#[derive(Clone, PartialEq, Message)]
struct PbException {
    #[prost(int32, tag = "1")]
    error_code: i32,
    #[prost(string, tag = "2")]
    message: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl HeadCodec for ProtoCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Proto
    }

    fn encode_head(&self, head: &RpcHead, out: &mut BytesMut) -> Result<(), RpcError> {
        let wire = PbHead {
            version: head.version as u32,
            msg_type: head.msg_type as u32,
            session_id: head.session_id,
            function_name: head.function_name.clone(),
        };
        wire.encode_length_delimited(out)
            .map_err(|_| RpcError::EncodeFailed)
    }

    fn decode_head(&self, buf: &[u8]) -> Result<(RpcHead, usize), RpcError> {
        let mut cur = buf;
        let len = prost::decode_length_delimiter(&mut cur).map_err(|_| RpcError::DecodeFailed)?;
        let delimiter_len = buf.len() - cur.len();
        if cur.len() < len {
            return Err(RpcError::DecodeFailed);
        }
        let wire = PbHead::decode(&cur[..len]).map_err(|_| RpcError::DecodeFailed)?;
        if wire.version > u8::MAX as u32 || wire.msg_type > u8::MAX as u32 {
            return Err(RpcError::DecodeFailed);
        }
        Ok((
            RpcHead {
                version: wire.version as u8,
                msg_type: MsgType::try_from(wire.msg_type as u8)?,
                session_id: wire.session_id,
                function_name: wire.function_name,
            },
            delimiter_len + len,
        ))
    }

    fn encode_exception(&self, ex: &RpcException, out: &mut BytesMut) -> Result<(), RpcError> {
        let wire = PbException { error_code: ex.error_code, message: ex.message.clone() };
        wire.encode(out).map_err(|_| RpcError::EncodeFailed)
    }

    fn decode_exception(&self, buf: &[u8]) -> Result<RpcException, RpcError> {
        let wire = PbException::decode(buf).map_err(|_| RpcError::DecodeFailed)?;
        Ok(RpcException { error_code: wire.error_code, message: wire.message })
    }
}
