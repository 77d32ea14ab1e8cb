// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! JSON codec: the head is one self-delimiting JSON object, the payload
//! starts at the first byte after it. Used by the control-command service
//! and by callers that want a wire a human can read.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    codec::{CodecKind, HeadCodec, MsgType, RpcException, RpcHead},
    error::RpcError,
};

#[derive(Debug, Serialize)]
struct JsonHead<'a> {
    version: u8,
    msg_type: u8,
    session_id: u64,
    function_name: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl HeadCodec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn encode_head(&self, head: &RpcHead, out: &mut BytesMut) -> Result<(), RpcError> {
        let wire = JsonHead {
            version: head.version,
            msg_type: head.msg_type as u8,
            session_id: head.session_id,
            function_name: &head.function_name,
        };
        let encoded = serde_json::to_vec(&wire).map_err(|_| RpcError::EncodeFailed)?;
        out.put_slice(&encoded);
        Ok(())
    }

    fn decode_head(&self, buf: &[u8]) -> Result<(RpcHead, usize), RpcError> {
        // The stream deserializer stops at the end of the first value,
        // which is exactly the head/payload boundary.
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<serde_json::Value>();
        let value = match stream.next() {
            Some(Ok(v)) => v,
            _ => return Err(RpcError::DecodeFailed),
        };
        let consumed = stream.byte_offset();
        let head: OwnedJsonHead =
            serde_json::from_value(value).map_err(|_| RpcError::DecodeFailed)?;
        Ok((
            RpcHead {
                version: head.version,
                msg_type: MsgType::try_from(head.msg_type)?,
                session_id: head.session_id,
                function_name: head.function_name,
            },
            consumed,
        ))
    }

    fn encode_exception(&self, ex: &RpcException, out: &mut BytesMut) -> Result<(), RpcError> {
        let encoded = serde_json::to_vec(ex).map_err(|_| RpcError::EncodeFailed)?;
        out.put_slice(&encoded);
        Ok(())
    }

    fn decode_exception(&self, buf: &[u8]) -> Result<RpcException, RpcError> {
        serde_json::from_slice(buf).map_err(|_| RpcError::DecodeFailed)
    }
}

#[derive(Debug, Deserialize)]
struct OwnedJsonHead {
    version: u8,
    msg_type: u8,
    session_id: u64,
    function_name: String,
}
