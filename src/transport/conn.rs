// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Per-handle connection records.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Mutex, atomic::AtomicU64},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{codec::CodecKind, transport::handle::Handle};

/// What a handle is at runtime. Listeners are passive; peers carry data
/// and are subject to the idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnKind {
    TcpListener,
    HttpListener,
    /// A bound or connected UDP socket; `connected` fixes the remote.
    UdpEndpoint { connected: bool },
    TcpAccepted,
    TcpConnected,
    HttpAccepted,
    HttpClient,
}

impl ConnKind {
    pub(crate) fn is_peer(&self) -> bool {
        matches!(
            self,
            ConnKind::TcpAccepted
                | ConnKind::TcpConnected
                | ConnKind::HttpAccepted
                | ConnKind::HttpClient
        )
    }

    pub(crate) fn is_listener(&self) -> bool {
        matches!(self, ConnKind::TcpListener | ConnKind::HttpListener)
    }
}

/// One endpoint of a transport. The outbound side is a bounded queue
/// drained by the connection's io task; the inbound side is a FIFO of
/// fully-framed messages filled by the same task.
pub(crate) struct Conn {
    pub(crate) handle: Handle,
    pub(crate) kind: ConnKind,
    pub(crate) codec: CodecKind,
    pub(crate) url: String,
    pub(crate) send_tx: mpsc::Sender<Bytes>,
    pub(crate) inbound: Mutex<VecDeque<Bytes>>,
    pub(crate) last_active_ms: AtomicU64,
    /// Source address of the latest datagram on a UDP endpoint; replies
    /// on the bound socket go here.
    pub(crate) udp_peer: Mutex<Option<SocketAddr>>,
    pub(crate) cancel: CancellationToken,
}

impl Conn {
    pub(crate) fn push_inbound(&self, msg: Bytes) {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(msg);
    }

    pub(crate) fn pop_inbound(&self) -> Option<Bytes> {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub(crate) fn peek_inbound(&self) -> Option<Bytes> {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .cloned()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}
