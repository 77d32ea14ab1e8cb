// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Banded error codes shared across the fabric.
//!
//! Every subsystem reports failures as small `i32` codes grouped by band:
//! naming (-1000…), router (-2000…), message/transport (-3000…), rpc
//! (-4000…) and coordination store (-5000…). The numeric code is the wire
//! and log identity; [`describe`] maps any code back to a human string.

use thiserror::Error;

/// Success code shared by every band.
pub const OK: i32 = 0;
/// Catch-all system failure outside any band.
pub const SYSTEM_ERROR: i32 = -1;

/// Common trait for the banded enums: the stable `i32` identity.
pub trait ErrorCode {
    fn code(&self) -> i32;
}

/// Naming-layer failures (-1000 band).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NamingError {
    #[error("naming: invalid parameter")]
    InvalidParam = -1001,
    #[error("naming: url already registered")]
    UrlAlreadyRegistered = -1002,
    #[error("naming: url not bound")]
    UrlNotBound = -1003,
    #[error("naming: register failed")]
    RegisterFailed = -1004,
    #[error("naming: factory map is null")]
    FactoryMapNull = -1005,
    #[error("naming: factory already exists")]
    FactoryExisted = -1006,
}

/// Router failures (-2000 band).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RouterError {
    #[error("router: invalid parameter")]
    InvalidParam = -2001,
    #[error("router: no valid handle")]
    NoValidHandle = -2002,
    #[error("router: factory map is null")]
    FactoryMapNull = -2003,
    #[error("router: factory already exists")]
    FactoryExisted = -2004,
}

/// Transport/message failures (-3000 band).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgError {
    #[error("message: driver not installed")]
    UninstallDriver = -3001,
    #[error("message: invalid parameter")]
    InvalidParam = -3002,
    #[error("message: event loop init failed")]
    EpollInitFailed = -3003,
    #[error("message: net io init failed")]
    NetIoInitFailed = -3004,
    #[error("message: bind address failed")]
    BindAddrFailed = -3005,
    #[error("message: connect address failed")]
    ConnectAddrFailed = -3006,
    #[error("message: cache failed")]
    CacheFailed = -3007,
    #[error("message: send buffer is full")]
    SendBuffNotEnough = -3008,
    #[error("message: send failed")]
    SendFailed = -3009,
    #[error("message: unknown connection")]
    UnknownConnection = -3010,
    #[error("message: received invalid data")]
    RecvInvalidData = -3011,
    #[error("message: receive buffer too small")]
    RecvBuffNotEnough = -3012,
    #[error("message: nothing to receive")]
    RecvEmpty = -3013,
    #[error("message: receive failed")]
    RecvFailed = -3014,
    #[error("message: error event on handle")]
    GetErrEvent = -3015,
    #[error("message: unsupported operation")]
    Unsupport = -3016,
}

/// RPC-engine failures (-4000 band). The -4100 sub-band carries overload
/// signals surfaced to remote callers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RpcError {
    #[error("rpc: invalid parameter")]
    InvalidParam = -4001,
    #[error("rpc: encode failed")]
    EncodeFailed = -4002,
    #[error("rpc: decode failed")]
    DecodeFailed = -4003,
    #[error("rpc: received exception message")]
    RecvExceptionMsg = -4004,
    #[error("rpc: unknown message type")]
    UnknownType = -4005,
    #[error("rpc: unsupported function name")]
    UnsupportedFunctionName = -4006,
    #[error("rpc: session not found")]
    SessionNotFound = -4007,
    #[error("rpc: send failed")]
    SendFailed = -4008,
    #[error("rpc: request timeout")]
    RequestTimeout = -4009,
    #[error("rpc: function name already registered")]
    FunctionNameExisted = -4010,
    #[error("rpc: system error")]
    SystemError = -4011,
    #[error("rpc: process timeout")]
    ProcessTimeout = -4012,
    #[error("rpc: broadcast failed")]
    BroadcastFailed = -4013,
    #[error("rpc: function name not registered")]
    FunctionNameUnexisted = -4014,
    #[error("rpc: message expired under overload")]
    MessageExpired = -4101,
    #[error("rpc: task overload")]
    TaskOverload = -4102,
}

/// Coordination-store failures (-5000 band), mirroring the store's own
/// result set.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StoreError {
    #[error("store: node does not exist")]
    NoNode = -5001,
    #[error("store: node already exists")]
    NodeExists = -5002,
    #[error("store: version mismatch")]
    BadVersion = -5003,
    #[error("store: not authenticated")]
    NoAuth = -5004,
    #[error("store: connection loss")]
    ConnectionLoss = -5005,
    #[error("store: session expired")]
    SessionExpired = -5006,
    #[error("store: operation timeout")]
    OperationTimeout = -5007,
    #[error("store: invalid parameter")]
    InvalidParam = -5008,
}

macro_rules! impl_error_code {
    ($($ty:ty),+) => {
        $(impl ErrorCode for $ty {
            #[inline]
            fn code(&self) -> i32 {
                *self as i32
            }
        })+
    };
}

impl_error_code!(NamingError, RouterError, MsgError, RpcError, StoreError);

/// Maps any banded code (or 0 / -1) to its registry string. Unknown codes
/// collapse to `"unknown error"` rather than failing.
pub fn describe(code: i32) -> &'static str {
    match code {
        OK => "ok",
        SYSTEM_ERROR => "system error",

        -1001 => "naming: invalid parameter",
        -1002 => "naming: url already registered",
        -1003 => "naming: url not bound",
        -1004 => "naming: register failed",
        -1005 => "naming: factory map is null",
        -1006 => "naming: factory already exists",

        -2001 => "router: invalid parameter",
        -2002 => "router: no valid handle",
        -2003 => "router: factory map is null",
        -2004 => "router: factory already exists",

        -3001 => "message: driver not installed",
        -3002 => "message: invalid parameter",
        -3003 => "message: event loop init failed",
        -3004 => "message: net io init failed",
        -3005 => "message: bind address failed",
        -3006 => "message: connect address failed",
        -3007 => "message: cache failed",
        -3008 => "message: send buffer is full",
        -3009 => "message: send failed",
        -3010 => "message: unknown connection",
        -3011 => "message: received invalid data",
        -3012 => "message: receive buffer too small",
        -3013 => "message: nothing to receive",
        -3014 => "message: receive failed",
        -3015 => "message: error event on handle",
        -3016 => "message: unsupported operation",

        -4001 => "rpc: invalid parameter",
        -4002 => "rpc: encode failed",
        -4003 => "rpc: decode failed",
        -4004 => "rpc: received exception message",
        -4005 => "rpc: unknown message type",
        -4006 => "rpc: unsupported function name",
        -4007 => "rpc: session not found",
        -4008 => "rpc: send failed",
        -4009 => "rpc: request timeout",
        -4010 => "rpc: function name already registered",
        -4011 => "rpc: system error",
        -4012 => "rpc: process timeout",
        -4013 => "rpc: broadcast failed",
        -4014 => "rpc: function name not registered",
        -4101 => "rpc: message expired under overload",
        -4102 => "rpc: task overload",

        -5001 => "store: node does not exist",
        -5002 => "store: node already exists",
        -5003 => "store: version mismatch",
        -5004 => "store: not authenticated",
        -5005 => "store: connection loss",
        -5006 => "store: session expired",
        -5007 => "store: operation timeout",
        -5008 => "store: invalid parameter",

        _ => "unknown error",
    }
}
