// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use weft::{codec::CodecKind, naming::memory::MemoryStore};

use super::common::{TagService, start_node, test_config, wait_until};

#[tokio::test]
async fn call_over_http_post_round_trip() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(1, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(2, ""), Arc::clone(&store)).await;

    let listen = "http://127.0.0.1:19151";
    server
        .bind(listen, CodecKind::Json)
        .await
        .expect("server bind");
    let _ = server.register_service("Echo", Arc::new(TagService { tag: "h" }));

    let h = client
        .connect(listen, CodecKind::Json)
        .await
        .expect("client connect");

    let reply = client
        .engine()
        .call(h, "Echo:echo", b"post body", 5_000)
        .await
        .expect("http echo reply");
    assert_eq!(reply.as_ref(), b"h:post body");

    // The client handle is one-shot: after the exchange it is gone.
    assert!(
        wait_until(Duration::from_secs(1), || !client.transport().is_open(h)).await,
        "http client handle must close after the response"
    );
    assert_eq!(client.engine().session_count(), 0);
}

#[tokio::test]
async fn http_server_answers_sequential_requests_per_connection() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(3, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(4, ""), Arc::clone(&store)).await;

    let listen = "http://127.0.0.1:19152";
    server
        .bind(listen, CodecKind::Json)
        .await
        .expect("server bind");
    let _ = server.register_service("Echo", Arc::new(TagService { tag: "h" }));

    for i in 0..3u8 {
        let h = client
            .connect(listen, CodecKind::Json)
            .await
            .expect("client connect");
        let body = vec![b'0' + i];
        let reply = client
            .engine()
            .call(h, "Echo:echo", &body, 5_000)
            .await
            .expect("http echo reply");
        assert_eq!(reply.as_ref(), [b'h', b':', b'0' + i]);
    }
}
