// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! The message transport: one handle-based, connectionless API over
//! framed TCP, UDP datagrams and HTTP/1.1 request-response.
//!
//! Each live connection is driven by its own io task; fully-framed
//! inbound messages land in the per-handle FIFO and a [`NetEvent`] is
//! queued for the update loop. Outbound bytes go through a bounded
//! per-handle send queue, which is the back-pressure point: when it is
//! full, [`Transport::send`] fails with `SendBuffNotEnough` instead of
//! blocking.

pub mod frame;
pub mod handle;
pub mod url;

mod conn;
mod http;
mod idle;
mod tcp;
mod udp;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex, Weak, atomic::Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::CodecKind,
    error::MsgError,
    transport::{
        conn::{Conn, ConnKind},
        handle::{Handle, HandleAllocator, slot_of},
        idle::IdleTracker,
        url::{Endpoint, Scheme},
    },
};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on the process-wide monotonic clock. Used for activity
/// stamps and session deadlines.
pub(crate) fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Transport tuning knobs; the defaults are the documented ones.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest accepted frame payload.
    pub recv_buffer_limit: usize,
    /// Bounded outbound queue depth per handle.
    pub send_queue_limit: usize,
    /// Reconnect attempts for connected TCP handles.
    pub reconnect_attempts: u32,
    /// Peers idle past this are closed by the sweep.
    pub idle_timeout: Duration,
    /// Establishing (and re-establishing) TCP connections.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_limit: 2 * 1024 * 1024,
            send_queue_limit: 10_000,
            reconnect_attempts: 3,
            idle_timeout: Duration::from_secs(100),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEventKind {
    /// A listener produced a new peer handle.
    Accepted { listener: Handle },
    /// The handle has at least one framed message queued.
    Message,
    /// The peer vanished: remote close, io error, or idle eviction.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct NetEvent {
    pub handle: Handle,
    pub kind: NetEventKind,
}

type IdlePolicy = Box<dyn Fn(Handle) -> bool + Send + Sync>;

/// The transport instance. Owned by the node; io tasks hold a weak
/// reference so shutdown is not kept alive by its own workers.
pub struct Transport {
    cfg: TransportConfig,
    conns: DashMap<u32, Arc<Conn>>,
    alloc: StdMutex<HandleAllocator>,
    events_tx: mpsc::UnboundedSender<NetEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<NetEvent>>,
    idle: StdMutex<IdleTracker>,
    /// Consulted before an idle eviction; returning false re-stamps the
    /// peer instead of closing it.
    idle_policy: OnceCell<IdlePolicy>,
    self_weak: OnceCell<Weak<Transport>>,
}

impl Transport {
    pub fn new(cfg: TransportConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let t = Arc::new(Self {
            cfg,
            conns: DashMap::new(),
            alloc: StdMutex::new(HandleAllocator::new()),
            events_tx,
            events_rx: Mutex::new(events_rx),
            idle: StdMutex::new(IdleTracker::new()),
            idle_policy: OnceCell::new(),
            self_weak: OnceCell::new(),
        });
        let _ = t.self_weak.set(Arc::downgrade(&t));
        t
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    /// Installs the idle-close veto. May be set once, before serving.
    pub fn set_idle_policy(&self, policy: IdlePolicy) {
        let _ = self.idle_policy.set(policy);
    }

    fn weak(&self) -> Weak<Transport> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    // ---- lifecycle -----------------------------------------------------

    /// Binds a listener (TCP/HTTP) or endpoint (UDP) and starts serving.
    pub async fn bind(&self, raw_url: &str, codec: CodecKind) -> Result<Handle, MsgError> {
        let ep = Endpoint::parse(raw_url)?;
        match ep.scheme {
            Scheme::Tcp | Scheme::Http => {
                let listener = TcpListener::bind(ep.addr())
                    .await
                    .map_err(|_| MsgError::BindAddrFailed)?;
                let kind = if ep.scheme == Scheme::Tcp {
                    ConnKind::TcpListener
                } else {
                    ConnKind::HttpListener
                };
                let (conn, _send_rx) = self.register(kind, codec, raw_url);
                let h = conn.handle;
                if ep.scheme == Scheme::Tcp {
                    tokio::spawn(tcp::run_listener(self.weak(), h, listener, conn.cancel.clone()));
                } else {
                    tokio::spawn(http::run_listener(self.weak(), h, listener, conn.cancel.clone()));
                }
                info!(handle = h, url = raw_url, "listening");
                Ok(h)
            },
            Scheme::Udp => {
                let socket = UdpSocket::bind(ep.addr())
                    .await
                    .map_err(|_| MsgError::BindAddrFailed)?;
                let (conn, send_rx) = self.register(
                    ConnKind::UdpEndpoint { connected: false },
                    codec,
                    raw_url,
                );
                let h = conn.handle;
                tokio::spawn(udp::run_endpoint(self.weak(), conn, socket, send_rx, false));
                info!(handle = h, url = raw_url, "listening");
                Ok(h)
            },
            Scheme::Broadcast => Err(MsgError::Unsupport),
        }
    }

    /// Connects an active peer handle.
    pub async fn connect(&self, raw_url: &str, codec: CodecKind) -> Result<Handle, MsgError> {
        let ep = Endpoint::parse(raw_url)?;
        match ep.scheme {
            Scheme::Tcp => {
                let stream = timeout(self.cfg.connect_timeout, TcpStream::connect(ep.addr()))
                    .await
                    .map_err(|_| MsgError::ConnectAddrFailed)?
                    .map_err(|_| MsgError::ConnectAddrFailed)?;
                let _ = stream.set_nodelay(true);
                let (conn, send_rx) = self.register(ConnKind::TcpConnected, codec, raw_url);
                let h = conn.handle;
                tokio::spawn(tcp::run_connected(self.weak(), conn, stream, send_rx));
                debug!(handle = h, url = raw_url, "connected");
                Ok(h)
            },
            Scheme::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|_| MsgError::NetIoInitFailed)?;
                socket
                    .connect(ep.addr())
                    .await
                    .map_err(|_| MsgError::ConnectAddrFailed)?;
                let (conn, send_rx) =
                    self.register(ConnKind::UdpEndpoint { connected: true }, codec, raw_url);
                let h = conn.handle;
                tokio::spawn(udp::run_endpoint(self.weak(), conn, socket, send_rx, true));
                Ok(h)
            },
            Scheme::Http => {
                let stream = timeout(self.cfg.connect_timeout, TcpStream::connect(ep.addr()))
                    .await
                    .map_err(|_| MsgError::ConnectAddrFailed)?
                    .map_err(|_| MsgError::ConnectAddrFailed)?;
                let _ = stream.set_nodelay(true);
                let (conn, send_rx) = self.register(ConnKind::HttpClient, codec, raw_url);
                let h = conn.handle;
                tokio::spawn(http::run_client(self.weak(), conn, stream, send_rx));
                Ok(h)
            },
            Scheme::Broadcast => Err(MsgError::Unsupport),
        }
    }

    /// Closes a handle. Idempotent; pending sends are dropped and the
    /// slot returns to the free-list under a fresh generation.
    pub fn close(&self, h: Handle) {
        self.drop_conn(h, false, false);
    }

    /// Io tasks report a dead peer through here so the poll loop sees a
    /// `Closed` event and pending inbound data is discarded.
    pub(crate) fn close_from_io(&self, h: Handle) {
        self.drop_conn(h, true, false);
    }

    /// One-shot HTTP clients deliver their message and then die; keep the
    /// inbound FIFO readable until the message event is consumed.
    pub(crate) fn close_from_io_keep_inbound(&self, h: Handle) {
        self.drop_conn(h, true, true);
    }

    fn drop_conn(&self, h: Handle, notify: bool, keep_inbound: bool) {
        let slot = slot_of(h);
        let is_current = self
            .conns
            .get(&slot)
            .is_some_and(|c| c.handle == h);
        if !is_current {
            return;
        }
        // keep_inbound keeps the record alive (but cancelled) so recv and
        // peek still drain already-delivered messages.
        let removed = if keep_inbound {
            self.conns.get(&slot).map(|c| Arc::clone(c.value()))
        } else {
            self.conns.remove(&slot).map(|(_, c)| c)
        };
        let Some(conn) = removed else { return };
        conn.cancel.cancel();
        if !keep_inbound {
            self.idle.lock().unwrap_or_else(|e| e.into_inner()).remove(h);
            self.alloc
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .release(h);
        }
        if notify {
            let _ = self.events_tx.send(NetEvent { handle: h, kind: NetEventKind::Closed });
        }
        debug!(handle = h, url = %conn.url, "closed");
    }

    // ---- data path -----------------------------------------------------

    /// Enqueues one message. TCP peers get it framed; UDP and HTTP carry
    /// the payload as-is.
    pub fn send(&self, h: Handle, payload: &[u8]) -> Result<(), MsgError> {
        self.send_impl(h, |kind| match kind {
            ConnKind::TcpAccepted | ConnKind::TcpConnected => frame::encode_frame(payload),
            _ => Bytes::copy_from_slice(payload),
        })
    }

    /// Scatter-gather variant; behaves exactly as if the fragments were
    /// concatenated into one `send`.
    pub fn sendv(&self, h: Handle, frags: &[&[u8]]) -> Result<(), MsgError> {
        self.send_impl(h, |kind| match kind {
            ConnKind::TcpAccepted | ConnKind::TcpConnected => frame::encode_frame_vectored(frags),
            _ => {
                let total: usize = frags.iter().map(|f| f.len()).sum();
                let mut out = bytes::BytesMut::with_capacity(total);
                for f in frags {
                    out.extend_from_slice(f);
                }
                out.freeze()
            },
        })
    }

    fn send_impl<F>(&self, h: Handle, encode: F) -> Result<(), MsgError>
    where F: FnOnce(ConnKind) -> Bytes {
        let conn = self.lookup(h).ok_or(MsgError::SendFailed)?;
        if conn.cancel.is_cancelled() {
            return Err(MsgError::SendFailed);
        }
        if conn.kind.is_listener() {
            // Listener handles carry no data path except UDP, which has
            // no separate accepted handle.
            return Err(MsgError::Unsupport);
        }
        let buf = encode(conn.kind);
        match conn.send_tx.try_send(buf) {
            Ok(()) => {
                self.touch(&conn);
                Ok(())
            },
            Err(mpsc::error::TrySendError::Full(_)) => Err(MsgError::SendBuffNotEnough),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MsgError::SendFailed),
        }
    }

    /// Takes the next framed message off the handle, if any.
    pub fn recv(&self, h: Handle) -> Result<Bytes, MsgError> {
        let conn = self.lookup(h).ok_or(MsgError::UnknownConnection)?;
        conn.pop_inbound().ok_or(MsgError::RecvEmpty)
    }

    /// Zero-copy look at the next message; pair with [`Self::pop`].
    pub fn peek(&self, h: Handle) -> Result<Bytes, MsgError> {
        let conn = self.lookup(h).ok_or(MsgError::UnknownConnection)?;
        conn.peek_inbound().ok_or(MsgError::RecvEmpty)
    }

    pub fn pop(&self, h: Handle) -> Result<(), MsgError> {
        let conn = self.lookup(h).ok_or(MsgError::UnknownConnection)?;
        conn.pop_inbound().map(|_| ()).ok_or(MsgError::RecvEmpty)
    }

    /// Readiness-loop entry point. A zero timeout drains without waiting.
    pub async fn poll(&self, wait: Duration) -> Option<NetEvent> {
        let mut rx = self.events_rx.lock().await;
        if wait.is_zero() {
            rx.try_recv().ok()
        } else {
            timeout(wait, rx.recv()).await.ok().flatten()
        }
    }

    pub fn codec_of(&self, h: Handle) -> Option<CodecKind> {
        self.lookup(h).map(|c| c.codec)
    }

    pub fn url_of(&self, h: Handle) -> Option<String> {
        self.lookup(h).map(|c| c.url.clone())
    }

    pub fn is_open(&self, h: Handle) -> bool {
        self.lookup(h).is_some_and(|c| !c.cancel.is_cancelled())
    }

    /// Live connection records (listeners included).
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    // ---- maintenance ---------------------------------------------------

    /// Walks peers from the oldest: anything idle past the configured
    /// timeout is closed (unless the idle policy vetoes, which
    /// re-stamps). Returns the closed handles.
    pub fn sweep_idle(&self) -> Vec<Handle> {
        let now = now_ms();
        let timeout_ms = self.cfg.idle_timeout.as_millis() as u64;
        let candidates = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.expire(now, timeout_ms)
        };

        let mut closed = Vec::new();
        for h in candidates {
            let Some(conn) = self.lookup(h) else { continue };
            let last = conn.last_active_ms.load(Ordering::Relaxed);
            let fresh = now.saturating_sub(last) < timeout_ms;
            let vetoed = self.idle_policy.get().is_some_and(|p| !p(h));
            if fresh || vetoed {
                self.idle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .touch(h, if fresh { last } else { now });
                continue;
            }
            debug!(handle = h, url = %conn.url, "idle close");
            self.close_from_io(h);
            closed.push(h);
        }
        closed
    }

    // ---- internals shared with the drivers -----------------------------

    fn register(
        &self,
        kind: ConnKind,
        codec: CodecKind,
        raw_url: &str,
    ) -> (Arc<Conn>, mpsc::Receiver<Bytes>) {
        let handle = self
            .alloc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .alloc();
        let (send_tx, send_rx) = mpsc::channel(self.cfg.send_queue_limit);
        let conn = Arc::new(Conn {
            handle,
            kind,
            codec,
            url: raw_url.to_string(),
            send_tx,
            inbound: StdMutex::new(VecDeque::new()),
            last_active_ms: std::sync::atomic::AtomicU64::new(now_ms()),
            udp_peer: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });
        self.conns.insert(slot_of(handle), Arc::clone(&conn));
        if kind.is_peer() {
            self.idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .touch(handle, now_ms());
        }
        (conn, send_rx)
    }

    pub(crate) fn adopt_tcp_accepted(
        &self,
        listener: Handle,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let codec = self.codec_of(listener).unwrap_or_default();
        let url = format!("tcp://{peer}");
        let (conn, send_rx) = self.register(ConnKind::TcpAccepted, codec, &url);
        let h = conn.handle;
        tokio::spawn(tcp::run_accepted(self.weak(), conn, stream, send_rx));
        let _ = self
            .events_tx
            .send(NetEvent { handle: h, kind: NetEventKind::Accepted { listener } });
    }

    pub(crate) fn adopt_http_accepted(
        &self,
        listener: Handle,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let codec = self.codec_of(listener).unwrap_or_default();
        let url = format!("http://{peer}");
        let (conn, send_rx) = self.register(ConnKind::HttpAccepted, codec, &url);
        let h = conn.handle;
        tokio::spawn(http::run_accepted(self.weak(), conn, stream, send_rx));
        let _ = self
            .events_tx
            .send(NetEvent { handle: h, kind: NetEventKind::Accepted { listener } });
    }

    /// Queues the message and its event; called from io tasks.
    pub(crate) fn deliver(&self, conn: &Arc<Conn>, msg: Bytes) {
        conn.push_inbound(msg);
        self.touch(conn);
        let _ = self
            .events_tx
            .send(NetEvent { handle: conn.handle, kind: NetEventKind::Message });
    }

    fn touch(&self, conn: &Arc<Conn>) {
        conn.last_active_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn lookup(&self, h: Handle) -> Option<Arc<Conn>> {
        let conn = self.conns.get(&slot_of(h))?;
        (conn.handle == h).then(|| Arc::clone(conn.value()))
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for entry in self.conns.iter() {
            entry.cancel.cancel();
        }
        if !self.conns.is_empty() {
            warn!(count = self.conns.len(), "transport dropped with live connections");
        }
    }
}
