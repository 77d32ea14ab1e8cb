// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Broadcast channels: local fan-out to subscribed client handles plus a
//! single relay hop to peer servers that serve the same channel.
//!
//! Opening a channel publishes this server's relay URL under
//! `/<app>/_broadcast/<channel>` and watches that node, so peers discover
//! each other through naming alone. A watch fire only records the new
//! peer set; the broadcast step of the node's update tick applies it.
//! Relay handles are connected lazily on first send. A message arriving
//! via relay is delivered to local subscribers only and never forwarded
//! onward, which keeps arbitrary topologies loop-free.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    codec::{CodecKind, RpcException},
    error::RpcError,
    naming::Naming,
    rpc::{RequestCtx, RpcEngine, ServiceHandler},
    transport::{Transport, handle::Handle},
};

/// Internal service carrying server-to-server relay traffic.
pub const RELAY_SERVICE: &str = "_ChannelRelay";
pub const RELAY_METHOD: &str = "relay";

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Root of the app sub-tree in the coordination store.
    pub app_id: String,
    /// URL peers use to reach this server's relay listener.
    pub relay_url: String,
    pub instance_id: u64,
}

#[derive(Debug, Default)]
struct Channel {
    subscribers: BTreeSet<Handle>,
    /// Peer relay URL → lazily-connected handle.
    peers: BTreeMap<String, Option<Handle>>,
}

pub struct ChannelMgr {
    cfg: BroadcastConfig,
    transport: Arc<Transport>,
    naming: Arc<Naming>,
    engine: OnceCell<Weak<RpcEngine>>,
    channels: DashMap<String, Channel>,
    /// Peer URL sets reported by naming watches, keyed by channel and
    /// applied on the next maintenance tick. Sets are absolute, so a
    /// newer fire overwrites an older one.
    pending_peers: Mutex<BTreeMap<String, Vec<String>>>,
    self_weak: OnceCell<Weak<ChannelMgr>>,
}

impl ChannelMgr {
    pub fn new(
        cfg: BroadcastConfig,
        transport: Arc<Transport>,
        naming: Arc<Naming>,
    ) -> Arc<Self> {
        let mgr = Arc::new(Self {
            cfg,
            transport,
            naming,
            engine: OnceCell::new(),
            channels: DashMap::new(),
            pending_peers: Mutex::new(BTreeMap::new()),
            self_weak: OnceCell::new(),
        });
        let _ = mgr.self_weak.set(Arc::downgrade(&mgr));
        mgr
    }

    /// Wires the engine in after construction (the two reference each
    /// other weakly).
    pub fn attach_engine(&self, engine: &Arc<RpcEngine>) {
        let _ = self.engine.set(Arc::downgrade(engine));
    }

    /// The relay receiver to register with the engine.
    pub fn relay_service(&self) -> Arc<dyn ServiceHandler> {
        Arc::new(RelayService {
            channels: self.self_weak.get().cloned().unwrap_or_default(),
        })
    }

    fn engine(&self) -> Result<Arc<RpcEngine>, RpcError> {
        self.engine
            .get()
            .and_then(Weak::upgrade)
            .ok_or(RpcError::BroadcastFailed)
    }

    fn channel_path(&self, name: &str) -> String {
        format!("/{}/_broadcast/{}", self.cfg.app_id, name)
    }

    // ---- channel lifecycle ---------------------------------------------

    /// Opens a channel: registers this server as a relay for it and
    /// starts watching for peers.
    pub async fn open_channel(&self, name: &str) -> Result<(), RpcError> {
        if name.is_empty() || name.contains('/') {
            return Err(RpcError::InvalidParam);
        }
        if self.channels.contains_key(name) {
            warn!(channel = name, "channel already open");
            return Err(RpcError::BroadcastFailed);
        }

        let path = self.channel_path(name);
        self.naming
            .register(&path, &[self.cfg.relay_url.clone()], self.cfg.instance_id)
            .await
            .map_err(|e| {
                warn!(channel = name, code = e as i32, "relay registration failed: {e}");
                RpcError::BroadcastFailed
            })?;

        let weak = self.self_weak.get().cloned().unwrap_or_default();
        let channel_name = name.to_string();
        self.naming
            .watch_name(
                &path,
                Arc::new(move |urls: &[String]| {
                    if let Some(mgr) = weak.upgrade() {
                        mgr.enqueue_peers(&channel_name, urls.to_vec());
                    }
                }),
            )
            .await
            .map_err(|_| RpcError::BroadcastFailed)?;

        self.channels.insert(name.to_string(), Channel::default());

        // Seed the peer set so sends before the first watch fire still
        // reach peers that opened earlier.
        if let Ok(urls) = self.naming.get_urls_by_name(&path).await {
            self.apply_peers(name, urls);
        }
        info!(channel = name, "channel open");
        Ok(())
    }

    /// Closes a channel: unregisters the relay and drops peer handles.
    pub async fn close_channel(&self, name: &str) -> Result<(), RpcError> {
        let Some((_, channel)) = self.channels.remove(name) else {
            return Err(RpcError::InvalidParam);
        };
        for handle in channel.peers.into_values().flatten() {
            self.transport.close(handle);
        }
        let path = self.channel_path(name);
        if let Err(e) = self.naming.unregister(&path, self.cfg.instance_id).await {
            debug!(channel = name, "relay unregister failed: {e}");
        }
        Ok(())
    }

    pub fn join_channel(&self, name: &str, subscriber: Handle) -> Result<(), RpcError> {
        let mut channel = self.channels.get_mut(name).ok_or(RpcError::InvalidParam)?;
        channel.subscribers.insert(subscriber);
        Ok(())
    }

    pub fn quit_channel(&self, name: &str, subscriber: Handle) -> Result<(), RpcError> {
        let mut channel = self.channels.get_mut(name).ok_or(RpcError::InvalidParam)?;
        channel.subscribers.remove(&subscriber);
        Ok(())
    }

    /// Records the newest peer URL set for `channel`; applied by the
    /// next maintenance tick.
    fn enqueue_peers(&self, channel: &str, urls: Vec<String>) {
        self.pending_peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string(), urls);
    }

    /// Replaces the peer relay set of `channel` with `urls`: handles of
    /// vanished peers are closed, fresh peers stay pending until the
    /// first send. This server's own relay URL is excluded.
    pub fn apply_peers(&self, channel: &str, urls: Vec<String>) {
        let Some(mut record) = self.channels.get_mut(channel) else { return };
        let target: BTreeSet<String> = urls
            .into_iter()
            .filter(|u| *u != self.cfg.relay_url)
            .collect();

        let stale: Vec<String> = record
            .peers
            .keys()
            .filter(|url| !target.contains(*url))
            .cloned()
            .collect();
        for url in stale {
            if let Some(Some(handle)) = record.peers.remove(&url) {
                debug!(channel, %url, handle, "peer relay removed");
                self.transport.close(handle);
            }
        }
        for url in target {
            record.peers.entry(url).or_insert(None);
        }
    }

    // ---- data path -----------------------------------------------------

    /// Fans `payload` out as ONEWAY `function_name` messages: to every
    /// local subscriber, and (when `relay` is set) to every peer relay.
    /// Returns the number of destinations written.
    pub async fn publish(
        &self,
        channel: &str,
        function_name: &str,
        payload: &[u8],
        relay: bool,
    ) -> Result<usize, RpcError> {
        let engine = self.engine()?;
        let (subscribers, peers): (Vec<Handle>, Vec<(String, Option<Handle>)>) = {
            let record = self.channels.get(channel).ok_or(RpcError::BroadcastFailed)?;
            (
                record.subscribers.iter().copied().collect(),
                record.peers.iter().map(|(u, h)| (u.clone(), *h)).collect(),
            )
        };

        let mut delivered = 0usize;
        for subscriber in subscribers {
            match engine.send_oneway(subscriber, function_name, payload) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(channel, subscriber, "local fan-out failed: {e}"),
            }
        }

        if relay && !peers.is_empty() {
            let envelope = encode_envelope(channel, function_name, payload);
            for (url, existing) in peers {
                let handle = match existing {
                    Some(h) if self.transport.is_open(h) => h,
                    _ => match self.transport.connect(&url, CodecKind::Binary).await {
                        Ok(h) => {
                            if let Some(mut record) = self.channels.get_mut(channel) {
                                record.peers.insert(url.clone(), Some(h));
                            }
                            h
                        },
                        Err(e) => {
                            warn!(channel, %url, code = e as i32, "relay connect failed: {e}");
                            continue;
                        },
                    },
                };
                let target = format!("{RELAY_SERVICE}:{RELAY_METHOD}");
                match engine.send_oneway(handle, &target, &envelope) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!(channel, %url, "relay send failed: {e}");
                        if let Some(mut record) = self.channels.get_mut(channel) {
                            record.peers.insert(url, None);
                        }
                    },
                }
            }
        }

        Ok(delivered)
    }

    // ---- maintenance ---------------------------------------------------

    /// Applies queued peer-set changes, then prunes dead subscriber and
    /// relay handles. Returns the number of open channels.
    pub fn update(&self) -> usize {
        let queued: Vec<(String, Vec<String>)> = {
            let mut pending = self
                .pending_peers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending).into_iter().collect()
        };
        for (channel, urls) in queued {
            self.apply_peers(&channel, urls);
        }

        for mut entry in self.channels.iter_mut() {
            let record = entry.value_mut();
            record.subscribers.retain(|h| self.transport.is_open(*h));
            for peer in record.peers.values_mut() {
                if peer.is_some_and(|h| !self.transport.is_open(h)) {
                    *peer = None;
                }
            }
        }
        self.channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |c| c.subscribers.len())
    }

    pub fn peer_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |c| c.peers.len())
    }
}

// ---- relay wire format --------------------------------------------------

/// `[u16 channel_len][channel][u16 fn_len][fn][payload]`, lengths
/// big-endian. Codec-independent: relay links always run Binary.
fn encode_envelope(channel: &str, function_name: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(4 + channel.len() + function_name.len() + payload.len());
    out.put_u16(channel.len() as u16);
    out.put_slice(channel.as_bytes());
    out.put_u16(function_name.len() as u16);
    out.put_slice(function_name.as_bytes());
    out.put_slice(payload);
    out.to_vec()
}

fn decode_envelope(mut buf: &[u8]) -> Result<(String, String, Bytes), RpcError> {
    let mut read_string = |buf: &mut &[u8]| -> Result<String, RpcError> {
        if buf.len() < 2 {
            return Err(RpcError::DecodeFailed);
        }
        let len = buf.get_u16() as usize;
        if buf.len() < len {
            return Err(RpcError::DecodeFailed);
        }
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|_| RpcError::DecodeFailed)?
            .to_string();
        buf.advance(len);
        Ok(s)
    };
    let channel = read_string(&mut buf)?;
    let function_name = read_string(&mut buf)?;
    Ok((channel, function_name, Bytes::copy_from_slice(buf)))
}

/// Receives relayed messages and replays them locally with the relay
/// flag off.
struct RelayService {
    channels: Weak<ChannelMgr>,
}

#[async_trait]
impl ServiceHandler for RelayService {
    async fn call(
        &self,
        method: &str,
        payload: Bytes,
        _ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        if method != RELAY_METHOD {
            return Err(RpcException::from(RpcError::UnsupportedFunctionName));
        }
        let mgr = self
            .channels
            .upgrade()
            .ok_or_else(|| RpcException::from(RpcError::BroadcastFailed))?;
        let (channel, function_name, inner) = decode_envelope(&payload)?;
        mgr.publish(&channel, &function_name, &inner, false)
            .await
            .map_err(RpcException::from)?;
        Ok(Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let wire = encode_envelope("room", "Chat:deliver", b"hello");
        let (channel, function_name, payload) = decode_envelope(&wire).expect("decode");
        assert_eq!(channel, "room");
        assert_eq!(function_name, "Chat:deliver");
        assert_eq!(payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn truncated_envelope_fails() {
        let wire = encode_envelope("room", "Chat:deliver", b"");
        for cut in 0..wire.len().min(6) {
            assert!(decode_envelope(&wire[..cut]).is_err(), "cut={cut}");
        }
    }
}
