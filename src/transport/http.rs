// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! HTTP/1.1 driver.
//!
//! Server side: each POST carries one request message in its body; the
//! answer written back on the same handle becomes the 200 response body.
//! The parser is driven incrementally from the read buffer, so a request
//! split across TCP segments assembles correctly, and the connection can
//! serve sequential requests.
//!
//! Client side: a handle is one-shot. The first send issues the POST,
//! the 200 body is delivered as the single inbound message, then the
//! handle closes.

use std::sync::{Arc, Weak, atomic::Ordering};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::MsgError,
    transport::{Transport, conn::Conn, handle::Handle, now_ms, url::Endpoint},
};

const MAX_HEADERS: usize = 32;

/// One parsed HTTP message: body plus how many buffer bytes it consumed.
#[derive(Debug)]
struct ParsedBody {
    body: Bytes,
    consumed: usize,
}

/// Incremental request parse. `Ok(None)` means "need more bytes".
fn try_parse_request(buf: &[u8], max_body: usize) -> Result<Option<ParsedBody>, MsgError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(MsgError::RecvInvalidData),
    };
    if req.method != Some("POST") {
        return Err(MsgError::Unsupport);
    }
    let content_length = content_length(req.headers)?;
    if content_length > max_body {
        return Err(MsgError::RecvBuffNotEnough);
    }
    if buf.len() < header_len + content_length {
        return Ok(None);
    }
    Ok(Some(ParsedBody {
        body: Bytes::copy_from_slice(&buf[header_len..header_len + content_length]),
        consumed: header_len + content_length,
    }))
}

/// Incremental response parse; only a 200 yields a message.
fn try_parse_response(buf: &[u8], max_body: usize) -> Result<Option<ParsedBody>, MsgError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let header_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(MsgError::RecvInvalidData),
    };
    if resp.code != Some(200) {
        return Err(MsgError::RecvFailed);
    }
    let content_length = content_length(resp.headers)?;
    if content_length > max_body {
        return Err(MsgError::RecvBuffNotEnough);
    }
    if buf.len() < header_len + content_length {
        return Ok(None);
    }
    Ok(Some(ParsedBody {
        body: Bytes::copy_from_slice(&buf[header_len..header_len + content_length]),
        consumed: header_len + content_length,
    }))
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<usize, MsgError> {
    for h in headers {
        if h.name.eq_ignore_ascii_case("content-length") {
            return std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or(MsgError::RecvInvalidData);
        }
    }
    Ok(0)
}

fn response_bytes(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(body);
    out
}

fn request_bytes(host: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(96 + body.len());
    out.extend_from_slice(
        format!(
            "POST /rpc HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(body);
    out
}

/// Io task for an accepted server-side connection.
pub(crate) async fn run_accepted(
    transport: Weak<Transport>,
    conn: Arc<Conn>,
    mut stream: TcpStream,
    mut send_rx: mpsc::Receiver<Bytes>,
) {
    let max_body = match transport.upgrade() {
        Some(t) => t.config().recv_buffer_limit,
        None => return,
    };
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let mut chunk = [0u8; 16 * 1024];

    let err = loop {
        // Drain already-buffered requests before reading more.
        match try_parse_request(&buf, max_body) {
            Ok(Some(parsed)) => {
                let _ = buf.split_to(parsed.consumed);
                let Some(t) = transport.upgrade() else { return };
                t.deliver(&conn, parsed.body);
                continue;
            },
            Ok(None) => {},
            Err(e) => break Some(e),
        }

        tokio::select! {
            _ = conn.cancel.cancelled() => break None,

            reply = send_rx.recv() => {
                let Some(body) = reply else { break None };
                if stream.write_all(&response_bytes(&body)).await.is_err() {
                    break Some(MsgError::SendFailed);
                }
                conn.last_active_ms.store(now_ms(), Ordering::Relaxed);
            },

            read = stream.read(&mut chunk) => {
                match read {
                    Ok(0) => break None,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(_) => break Some(MsgError::RecvFailed),
                }
            },
        }
    };

    if let Some(e) = err {
        debug!(handle = conn.handle, code = e as i32, "http peer closed: {e}");
    }
    if let Some(t) = transport.upgrade() {
        t.close_from_io(conn.handle);
    }
}

/// Io task for a one-shot client handle: wait for the request body, POST
/// it, deliver the response, close.
pub(crate) async fn run_client(
    transport: Weak<Transport>,
    conn: Arc<Conn>,
    mut stream: TcpStream,
    mut send_rx: mpsc::Receiver<Bytes>,
) {
    let max_body = match transport.upgrade() {
        Some(t) => t.config().recv_buffer_limit,
        None => return,
    };

    let host = Endpoint::parse(&conn.url)
        .map(|ep| ep.addr())
        .unwrap_or_default();

    let outcome: Result<(), MsgError> = async {
        let body = tokio::select! {
            _ = conn.cancel.cancelled() => return Ok(()),
            b = send_rx.recv() => b.ok_or(MsgError::SendFailed)?,
        };
        stream
            .write_all(&request_bytes(&host, &body))
            .await
            .map_err(|_| MsgError::SendFailed)?;
        conn.last_active_ms.store(now_ms(), Ordering::Relaxed);

        let mut buf = BytesMut::with_capacity(4 * 1024);
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if let Some(parsed) = try_parse_response(&buf, max_body)? {
                let Some(t) = transport.upgrade() else { return Ok(()) };
                t.deliver(&conn, parsed.body);
                return Ok(());
            }
            let n = tokio::select! {
                _ = conn.cancel.cancelled() => return Ok(()),
                r = stream.read(&mut chunk) => r.map_err(|_| MsgError::RecvFailed)?,
            };
            if n == 0 {
                return Err(MsgError::RecvFailed);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
    .await;

    if let Err(e) = outcome {
        debug!(handle = conn.handle, code = e as i32, "http client failed: {e}");
    }
    // One-shot: the handle goes away after the exchange either way, but
    // an already-delivered message stays readable until the event is
    // consumed.
    if let Some(t) = transport.upgrade() {
        t.close_from_io_keep_inbound(conn.handle);
    }
}

/// Accept loop for an HTTP listener handle.
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
                t.adopt_http_accepted(listener_handle, stream, peer);
            },
            Err(e) => {
                warn!(handle = listener_handle, "accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            },
        }
    }
}
