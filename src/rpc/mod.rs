// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! The RPC engine: encodes outbound messages, decodes inbound ones,
//! dispatches CALL/ONEWAY to registered services, correlates
//! REPLY/EXCEPTION back to callers by session id, and sweeps timeouts.
//!
//! Handlers are hosted in scheduler tasks, so a handler may issue
//! further (awaited) calls without blocking the update loop.

mod session;

use std::{
    sync::{Arc, Weak, atomic::{AtomicU32, Ordering}},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use crate::rpc::session::ResponseCb;
use crate::{
    broadcast::ChannelMgr,
    codec::{CodecKind, HeadCodec, MsgType, RpcException, RpcHead},
    error::{ErrorCode, RpcError},
    rpc::session::{Session, SessionTable},
    sched::TaskSet,
    transport::{Transport, handle::Handle, now_ms},
};

/// Default request timeout applied when a caller passes zero or a
/// negative value.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Per-request context handed to service handlers.
pub struct RequestCtx {
    engine: Weak<RpcEngine>,
    /// The handle the request arrived on; replies go back the same way.
    pub handle: Handle,
    pub session_id: u64,
    pub msg_type: MsgType,
    pub function_name: String,
}

impl RequestCtx {
    /// The owning engine, for handlers that issue nested calls.
    pub fn engine(&self) -> Option<Arc<RpcEngine>> {
        self.engine.upgrade()
    }

    /// Current overload gauge; handlers may refuse work when non-zero.
    pub fn overload(&self) -> u32 {
        self.engine.upgrade().map_or(0, |e| e.overload())
    }
}

/// A registered service. The method component of the function name is
/// passed through for per-method dispatch inside the handler.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(
        &self,
        method: &str,
        payload: Bytes,
        ctx: RequestCtx,
    ) -> Result<Bytes, RpcException>;
}

pub struct RpcEngine {
    transport: Arc<Transport>,
    tasks: Arc<TaskSet>,
    sessions: SessionTable,
    services: DashMap<String, Arc<dyn ServiceHandler>>,
    default_timeout: Duration,
    /// Process-wide overload signal; non-zero refuses broadcast sends and
    /// is visible to handlers through [`RequestCtx::overload`].
    overload: AtomicU32,
    channels: OnceCell<Weak<ChannelMgr>>,
    self_weak: OnceCell<Weak<RpcEngine>>,
}

impl RpcEngine {
    pub fn new(
        transport: Arc<Transport>,
        tasks: Arc<TaskSet>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            transport,
            tasks,
            sessions: SessionTable::new(),
            services: DashMap::new(),
            default_timeout,
            overload: AtomicU32::new(0),
            channels: OnceCell::new(),
            self_weak: OnceCell::new(),
        });
        let _ = engine.self_weak.set(Arc::downgrade(&engine));
        engine
    }

    fn weak(&self) -> Weak<RpcEngine> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    /// Wires the broadcast subsystem in after construction; held weakly
    /// so the two can be dropped in either order.
    pub fn attach_channels(&self, channels: &Arc<ChannelMgr>) {
        let _ = self.channels.set(Arc::downgrade(channels));
    }

    // ---- service registry ----------------------------------------------

    /// Registers `handler` under `name`. Re-registering an existing name
    /// replaces the handler and reports `FunctionNameExisted`; callers
    /// may treat that as a warning since the new handler is installed.
    pub fn register_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<String, RpcError> {
        if name.is_empty() || name.contains(':') {
            return Err(RpcError::InvalidParam);
        }
        let replaced = self.services.insert(name.to_string(), handler).is_some();
        if replaced {
            warn!(service = name, "service handler replaced");
            return Err(RpcError::FunctionNameExisted);
        }
        Ok(name.to_string())
    }

    pub fn unregister_service(&self, name: &str) -> Result<(), RpcError> {
        self.services
            .remove(name)
            .map(|_| ())
            .ok_or(RpcError::FunctionNameUnexisted)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    // ---- outbound ------------------------------------------------------

    /// Sends a CALL and arms its timer. `on_response` fires exactly once:
    /// reply, remote exception, timeout, or engine shutdown. A
    /// `timeout_ms <= 0` is coerced to the 60 s default. Returns the
    /// session id.
    pub fn send_request(
        &self,
        h: Handle,
        function_name: &str,
        payload: &[u8],
        on_response: ResponseCb,
        timeout_ms: i64,
    ) -> Result<u64, RpcError> {
        let timeout_ms = if timeout_ms <= 0 {
            self.default_timeout.as_millis() as u64
        } else {
            timeout_ms as u64
        };

        let session_id = self.sessions.next_id();
        let head = RpcHead::new(MsgType::Call, session_id, function_name);
        let msg = self.encode_for_handle(h, &head, payload)?;

        // Insert before the write so a fast reply always finds it.
        self.sessions.insert(session_id, Session {
            handle: h,
            cb: on_response,
            deadline_ms: now_ms() + timeout_ms,
        });

        if self.transport.send(h, &msg).is_err() {
            // The callback is not fired for a failed send; the error goes
            // straight back to the caller.
            let _ = self.sessions.take(session_id);
            return Err(RpcError::SendFailed);
        }
        Ok(session_id)
    }

    /// Awaitable form of [`send_request`](Self::send_request); the future
    /// resolves when the reply, exception, or timeout lands. Requires the
    /// update loop to be running.
    pub async fn call(
        &self,
        h: Handle,
        function_name: &str,
        payload: &[u8],
        timeout_ms: i64,
    ) -> Result<Bytes, RpcException> {
        let (tx, rx) = oneshot::channel();
        self.send_request(
            h,
            function_name,
            payload,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            timeout_ms,
        )
        .map_err(RpcException::from)?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcException::from(RpcError::SystemError)),
        }
    }

    /// Fire-and-forget: no session, no reply.
    pub fn send_oneway(
        &self,
        h: Handle,
        function_name: &str,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        let head = RpcHead::new(MsgType::Oneway, 0, function_name);
        let msg = self.encode_for_handle(h, &head, payload)?;
        self.transport
            .send(h, &msg)
            .map_err(|_| RpcError::SendFailed)
    }

    /// ONEWAY fan-out through a broadcast channel. Refused immediately
    /// while the overload signal is non-zero. Returns the number of
    /// destinations written.
    pub async fn broadcast_request(
        &self,
        channel: &str,
        function_name: &str,
        payload: &[u8],
    ) -> Result<usize, RpcError> {
        if self.overload() != 0 {
            return Err(RpcError::TaskOverload);
        }
        let channels = self
            .channels
            .get()
            .and_then(Weak::upgrade)
            .ok_or(RpcError::BroadcastFailed)?;
        channels.publish(channel, function_name, payload, true).await
    }

    // ---- inbound -------------------------------------------------------

    /// Feeds one framed message from the transport poll loop.
    pub fn on_message(&self, h: Handle, msg: Bytes) {
        let Some(kind) = self.transport.codec_of(h) else {
            debug!(handle = h, "message on unknown connection dropped");
            return;
        };
        let codec = kind.codec();
        let (head, consumed) = match codec.decode_head(&msg) {
            Ok(ok) => ok,
            Err(e) => {
                debug!(handle = h, code = e.code(), "undecodable head dropped");
                return;
            },
        };
        let payload = msg.slice(consumed..);

        match head.msg_type {
            MsgType::Reply => match self.sessions.take(head.session_id) {
                Some(session) => (session.cb)(Ok(payload)),
                // Expired earlier or never ours: consumed silently.
                None => debug!(session_id = head.session_id, "late reply dropped"),
            },
            MsgType::Exception => match self.sessions.take(head.session_id) {
                Some(session) => {
                    let ex = codec
                        .decode_exception(&payload)
                        .unwrap_or_else(RpcException::from);
                    (session.cb)(Err(ex));
                },
                None => debug!(session_id = head.session_id, "late exception dropped"),
            },
            MsgType::Call | MsgType::Oneway => self.dispatch(h, kind, head, payload),
        }
    }

    fn dispatch(&self, h: Handle, kind: CodecKind, head: RpcHead, payload: Bytes) {
        let (service, method) = match head.function_name.split_once(':') {
            Some((s, m)) => (s.to_string(), m.to_string()),
            None => {
                self.refuse(h, kind, &head, RpcError::UnsupportedFunctionName);
                return;
            },
        };
        let Some(handler) = self.services.get(&service).map(|e| Arc::clone(e.value())) else {
            self.refuse(h, kind, &head, RpcError::UnsupportedFunctionName);
            return;
        };

        let engine = self.weak();
        let is_call = head.msg_type == MsgType::Call;
        self.tasks.spawn_running(async move {
            let ctx = RequestCtx {
                engine: engine.clone(),
                handle: h,
                session_id: head.session_id,
                msg_type: head.msg_type,
                function_name: head.function_name.clone(),
            };
            let result = handler.call(&method, payload, ctx).await;
            if !is_call {
                return;
            }
            let Some(engine) = engine.upgrade() else { return };
            match result {
                Ok(bytes) => {
                    engine.send_reply(h, &head, &bytes);
                },
                Err(ex) => {
                    engine.send_exception(h, kind, &head, &ex);
                },
            }
        });
    }

    /// An EXCEPTION reply for a CALL that cannot be dispatched; ONEWAY is
    /// dropped silently.
    fn refuse(&self, h: Handle, kind: CodecKind, head: &RpcHead, err: RpcError) {
        if head.msg_type != MsgType::Call {
            debug!(function = %head.function_name, "oneway without handler dropped");
            return;
        }
        self.send_exception(h, kind, head, &RpcException::from(err));
    }

    fn send_reply(&self, h: Handle, request_head: &RpcHead, payload: &[u8]) {
        let head = RpcHead::new(
            MsgType::Reply,
            request_head.session_id,
            request_head.function_name.clone(),
        );
        match self.encode_for_handle(h, &head, payload) {
            Ok(msg) => {
                if let Err(e) = self.transport.send(h, &msg) {
                    debug!(handle = h, code = e.code(), "reply send failed");
                }
            },
            Err(e) => debug!(handle = h, code = e.code(), "reply encode failed"),
        }
    }

    fn send_exception(&self, h: Handle, kind: CodecKind, request_head: &RpcHead, ex: &RpcException) {
        let codec = kind.codec();
        let head = RpcHead::new(
            MsgType::Exception,
            request_head.session_id,
            request_head.function_name.clone(),
        );
        let mut out = BytesMut::new();
        if codec.encode_head(&head, &mut out).is_err() {
            return;
        }
        if codec.encode_exception(ex, &mut out).is_err() {
            return;
        }
        if let Err(e) = self.transport.send(h, &out) {
            debug!(handle = h, code = e.code(), "exception send failed");
        }
    }

    fn encode_for_handle(
        &self,
        h: Handle,
        head: &RpcHead,
        payload: &[u8],
    ) -> Result<Bytes, RpcError> {
        let kind = self.transport.codec_of(h).ok_or(RpcError::SendFailed)?;
        let codec = kind.codec();
        let mut out = BytesMut::with_capacity(64 + payload.len());
        codec.encode_head(head, &mut out)?;
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }

    // ---- maintenance ---------------------------------------------------

    /// Timeout sweep; returns how many sessions expired this tick.
    pub fn update(&self) -> usize {
        let expired = self.sessions.expire(now_ms());
        let count = expired.len();
        for (id, session) in expired {
            debug!(session_id = id, handle = session.handle, "request timeout");
            (session.cb)(Err(RpcException::from(RpcError::RequestTimeout)));
        }
        count
    }

    /// Fails every outstanding session and drops all services.
    pub fn shutdown(&self) {
        for (_, session) in self.sessions.drain() {
            (session.cb)(Err(RpcException::new(
                RpcError::SystemError.code(),
                "engine shutdown",
            )));
        }
        self.services.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn set_overload(&self, value: u32) {
        self.overload.store(value, Ordering::Relaxed);
    }

    pub fn overload(&self) -> u32 {
        self.overload.load(Ordering::Relaxed)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn tasks(&self) -> &Arc<TaskSet> {
        &self.tasks
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
