// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Pluggable wire formats for the RPC head and exception body.
//!
//! A codec is fixed per handle when it is bound or connected; an accepted
//! handle inherits its listener's codec. The payload that follows the head
//! is opaque to the engine; the codec only has to frame the head so the
//! decoder can tell where the payload starts.

pub mod binary;
pub mod json;
pub mod proto;

use bytes::BytesMut;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
pub use crate::codec::{binary::BinaryCodec, json::JsonCodec, proto::ProtoCodec};

/// Current RPC wire version.
pub const RPC_VERSION: u8 = 0;

/// Message-type tag carried in every head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl TryFrom<u8> for MsgType {
    type Error = RpcError;

    fn try_from(v: u8) -> Result<Self, RpcError> {
        Ok(match v {
            1 => MsgType::Call,
            2 => MsgType::Reply,
            3 => MsgType::Exception,
            4 => MsgType::Oneway,
            _ => return Err(RpcError::UnknownType),
        })
    }
}

/// Decoded RPC head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHead {
    pub version: u8,
    pub msg_type: MsgType,
    /// Monotonically increasing per engine; 0 means "no session" (ONEWAY).
    pub session_id: u64,
    /// `"ServiceName:method"`; the string is the on-wire dispatch identity.
    pub function_name: String,
}

impl RpcHead {
    pub fn new(msg_type: MsgType, session_id: u64, function_name: impl Into<String>) -> Self {
        Self {
            version: RPC_VERSION,
            msg_type,
            session_id,
            function_name: function_name.into(),
        }
    }
}

/// Body of an EXCEPTION message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcException {
    pub error_code: i32,
    pub message: String,
}

impl RpcException {
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        Self { error_code, message: message.into() }
    }
}

impl From<RpcError> for RpcException {
    fn from(e: RpcError) -> Self {
        use crate::error::ErrorCode;
        Self { error_code: e.code(), message: e.to_string() }
    }
}

/// Registry tag; also the `protocol_type` recorded in service-instance
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Binary,
    Json,
    Proto,
}

impl CodecKind {
    pub fn codec(self) -> Codec {
        match self {
            CodecKind::Binary => Codec::from(BinaryCodec),
            CodecKind::Json => Codec::from(JsonCodec),
            CodecKind::Proto => Codec::from(ProtoCodec),
        }
    }
}

/// Head/exception encoder-decoder pair.
///
/// `decode_head` returns the head plus the number of bytes it consumed;
/// the remainder of the message is the payload.
#[enum_dispatch]
pub trait HeadCodec {
    fn kind(&self) -> CodecKind;

    fn encode_head(&self, head: &RpcHead, out: &mut BytesMut) -> Result<(), RpcError>;

    fn decode_head(&self, buf: &[u8]) -> Result<(RpcHead, usize), RpcError>;

    fn encode_exception(&self, ex: &RpcException, out: &mut BytesMut) -> Result<(), RpcError>;

    fn decode_exception(&self, buf: &[u8]) -> Result<RpcException, RpcError>;
}

/// The process-wide codec set, written once during setup.
#[enum_dispatch(HeadCodec)]
#[derive(Debug, Clone)]
pub enum Codec {
    Binary(BinaryCodec),
    Json(JsonCodec),
    Proto(ProtoCodec),
}
