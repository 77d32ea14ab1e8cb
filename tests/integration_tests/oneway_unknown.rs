// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use weft::{codec::CodecKind, naming::memory::MemoryStore};

use super::common::{start_node, test_config};

#[tokio::test]
async fn oneway_to_unknown_service_is_dropped_without_leaks() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(1, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(2, ""), Arc::clone(&store)).await;

    let listen = "tcp://127.0.0.1:19121";
    server
        .bind(listen, CodecKind::Binary)
        .await
        .expect("server bind");

    let h = client
        .connect(listen, CodecKind::Binary)
        .await
        .expect("client connect");

    client
        .engine()
        .send_oneway(h, "Nope:x", b"")
        .expect("oneway send");

    // Give both loops time to process; nothing may come back and no
    // session may exist anywhere.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.engine().session_count(), 0);
    assert_eq!(server.engine().session_count(), 0);
    assert!(
        client.transport().recv(h).is_err(),
        "no reply message may arrive for a dropped oneway"
    );
}
