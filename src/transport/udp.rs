// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! UDP driver: one datagram is one message, boundaries preserved, no
//! reliability or ordering. A bound endpoint remembers the source of the
//! latest datagram so a reply on the same handle reaches that peer.

use std::sync::{Arc, Weak, atomic::Ordering};

use bytes::{Bytes, BytesMut};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, warn};

use crate::transport::{Transport, conn::Conn, now_ms};

/// Io task shared by bound and connected UDP endpoints.
pub(crate) async fn run_endpoint(
    transport: Weak<Transport>,
    conn: Arc<Conn>,
    socket: UdpSocket,
    mut send_rx: mpsc::Receiver<Bytes>,
    connected: bool,
) {
    let max = match transport.upgrade() {
        Some(t) => t.config().recv_buffer_limit,
        None => return,
    };
    let mut buf = BytesMut::zeroed(max.min(64 * 1024));

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,

            out = send_rx.recv() => {
                let Some(payload) = out else { break };
                let sent = if connected {
                    socket.send(&payload).await.is_ok()
                } else {
                    let peer = *conn
                        .udp_peer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    match peer {
                        Some(addr) => socket.send_to(&payload, addr).await.is_ok(),
                        None => {
                            debug!(handle = conn.handle, "udp send with no known peer");
                            false
                        },
                    }
                };
                if sent {
                    conn.last_active_ms.store(now_ms(), Ordering::Relaxed);
                } else {
                    warn!(handle = conn.handle, "udp send failed");
                }
            },

            inbound = socket.recv_from(&mut buf) => {
                match inbound {
                    Ok((n, from)) => {
                        *conn.udp_peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(from);
                        let Some(t) = transport.upgrade() else { break };
                        t.deliver(&conn, Bytes::copy_from_slice(&buf[..n]));
                    },
                    Err(e) => {
                        debug!(handle = conn.handle, "udp recv failed: {e}");
                        break;
                    },
                }
            },
        }
    }

    if let Some(t) = transport.upgrade() {
        t.close_from_io(conn.handle);
    }
}
