// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Framed-TCP driver: accept loop for listeners, a read/write io task
//! per peer, bounded auto-reconnect for client handles.

use std::sync::{Arc, Weak, atomic::Ordering};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::MsgError,
    transport::{
        Transport, now_ms,
        conn::Conn,
        frame::{FRAME_HEADER_LEN, FrameHeader},
        handle::Handle,
        url::Endpoint,
    },
};

/// Reads exactly one framed message. `RecvInvalidData` on a bad magic and
/// `RecvBuffNotEnough` on an oversized declared payload are both
/// unrecoverable for the stream.
async fn read_frame(rd: &mut OwnedReadHalf, max_payload: usize) -> Result<Bytes, MsgError> {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    rd.read_exact(&mut hdr)
        .await
        .map_err(|_| MsgError::RecvFailed)?;
    let len = FrameHeader::parse(&hdr, max_payload)?;

    let mut payload = BytesMut::zeroed(len);
    if len > 0 {
        rd.read_exact(&mut payload)
            .await
            .map_err(|_| MsgError::RecvFailed)?;
    }
    Ok(payload.freeze())
}

/// Drives one established stream until an io error, peer shutdown, or
/// cancellation. `None` means a clean cancel or sender-side drop.
async fn run_stream(
    transport: &Arc<Transport>,
    conn: &Arc<Conn>,
    stream: TcpStream,
    send_rx: &mut mpsc::Receiver<Bytes>,
) -> Option<MsgError> {
    let max_payload = transport.config().recv_buffer_limit;
    let (mut rd, mut wr) = stream.into_split();

    let read_side = async {
        loop {
            match read_frame(&mut rd, max_payload).await {
                Ok(msg) => transport.deliver(conn, msg),
                Err(e) => return e,
            }
        }
    };
    let write_side = async {
        while let Some(buf) = send_rx.recv().await {
            if wr.write_all(&buf).await.is_err() {
                return Some(MsgError::SendFailed);
            }
            conn.last_active_ms.store(now_ms(), Ordering::Relaxed);
        }
        None
    };

    tokio::select! {
        _ = conn.cancel.cancelled() => None,
        e = read_side => Some(e),
        w = write_side => w,
    }
}

/// Io task for an accepted peer: no reconnect, the handle dies with the
/// stream.
pub(crate) async fn run_accepted(
    transport: Weak<Transport>,
    conn: Arc<Conn>,
    stream: TcpStream,
    mut send_rx: mpsc::Receiver<Bytes>,
) {
    let Some(t) = transport.upgrade() else { return };
    if let Some(e) = run_stream(&t, &conn, stream, &mut send_rx).await {
        debug!(handle = conn.handle, code = e as i32, "accepted peer closed: {e}");
    }
    t.close_from_io(conn.handle);
}

/// Io task for a connected (client) peer: on stream failure the socket is
/// re-established up to `reconnect_attempts` times before the handle is
/// surfaced as closed. Sends buffered in the dead stream are discarded.
pub(crate) async fn run_connected(
    transport: Weak<Transport>,
    conn: Arc<Conn>,
    first: TcpStream,
    mut send_rx: mpsc::Receiver<Bytes>,
) {
    let mut stream = Some(first);
    let mut attempts_left = match transport.upgrade() {
        Some(t) => t.config().reconnect_attempts,
        None => return,
    };

    while let Some(s) = stream.take() {
        let Some(t) = transport.upgrade() else { return };

        let Some(err) = run_stream(&t, &conn, s, &mut send_rx).await else {
            break;
        };
        if conn.cancel.is_cancelled() || attempts_left == 0 {
            debug!(handle = conn.handle, code = err as i32, "peer closed: {err}");
            break;
        }

        let Ok(ep) = Endpoint::parse(&conn.url) else { break };
        while attempts_left > 0 {
            attempts_left -= 1;
            match timeout(t.config().connect_timeout, TcpStream::connect(ep.addr())).await {
                Ok(Ok(next)) => {
                    warn!(handle = conn.handle, url = %conn.url, "reconnected after {err}");
                    let _ = next.set_nodelay(true);
                    stream = Some(next);
                    break;
                },
                _ => {
                    warn!(
                        handle = conn.handle,
                        url = %conn.url,
                        attempts_left, "reconnect failed"
                    );
                },
            }
        }
    }

    if let Some(t) = transport.upgrade() {
        t.close_from_io(conn.handle);
    }
}

/// Accept loop for a TCP listener handle.
pub(crate) async fn run_listener(
    transport: Weak<Transport>,
    listener_handle: Handle,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((stream, peer)) => {
                let Some(t) = transport.upgrade() else { return };
                let _ = stream.set_nodelay(true);
                t.adopt_tcp_accepted(listener_handle, stream, peer);
            },
            Err(e) => {
                warn!(handle = listener_handle, "accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            },
        }
    }
}
