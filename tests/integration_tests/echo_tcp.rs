// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use weft::{
    codec::CodecKind,
    error::MsgError,
    naming::memory::MemoryStore,
};

use super::common::{TagService, start_node, test_config, wait_until};

#[tokio::test]
async fn echo_over_tcp_and_sessions_drain() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(1, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(2, ""), Arc::clone(&store)).await;

    let listen = "tcp://127.0.0.1:19101";
    server
        .bind(listen, CodecKind::Binary)
        .await
        .expect("server bind");
    let _ = server.register_service("Echo", Arc::new(TagService { tag: "s" }));

    let h = client
        .connect(listen, CodecKind::Binary)
        .await
        .expect("client connect");

    let reply = client
        .engine()
        .call(h, "Echo:echo", b"hi", 5_000)
        .await
        .expect("echo reply");
    assert_eq!(reply.as_ref(), b"s:hi");

    // Property: after the response fires the session is gone, on both
    // sides, within a tick.
    assert!(
        wait_until(Duration::from_secs(1), || {
            client.engine().session_count() == 0 && server.engine().session_count() == 0
        })
        .await
    );
}

#[tokio::test]
async fn closed_handle_rejects_send_and_recv() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(3, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(4, ""), Arc::clone(&store)).await;

    let listen = "tcp://127.0.0.1:19102";
    server
        .bind(listen, CodecKind::Binary)
        .await
        .expect("server bind");

    let h = client
        .connect(listen, CodecKind::Binary)
        .await
        .expect("client connect");
    client.transport().send(h, b"probe").expect("send while open");

    client.transport().close(h);
    assert_eq!(client.transport().send(h, b"x"), Err(MsgError::SendFailed));
    assert_eq!(
        client.transport().recv(h).expect_err("recv must fail"),
        MsgError::UnknownConnection
    );
    // Close is idempotent.
    client.transport().close(h);
}

#[tokio::test]
async fn echo_over_udp() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(5, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(6, ""), Arc::clone(&store)).await;

    let listen = "udp://127.0.0.1:19103";
    server
        .bind(listen, CodecKind::Binary)
        .await
        .expect("server bind");
    let _ = server.register_service("Echo", Arc::new(TagService { tag: "u" }));

    let h = client
        .connect(listen, CodecKind::Binary)
        .await
        .expect("client connect");

    let reply = client
        .engine()
        .call(h, "Echo:echo", b"datagram", 5_000)
        .await
        .expect("udp echo reply");
    assert_eq!(reply.as_ref(), b"u:datagram");
}
