// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use serial_test::serial;
use weft::{
    codec::CodecKind,
    naming::memory::MemoryStore,
    router::RoutePolicy,
};

use super::common::{TagService, start_node, test_config, wait_until};

const NAME: &str = "/demo/ServiceList/Foo";

#[tokio::test]
#[serial]
async fn round_robin_failover_to_the_survivor() {
    let store = MemoryStore::shared();
    let server_a = start_node(test_config(1, ""), Arc::clone(&store)).await;
    let server_b = start_node(test_config(2, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(3, ""), Arc::clone(&store)).await;

    let url_a = "tcp://127.0.0.1:19131";
    let url_b = "tcp://127.0.0.1:19132";
    server_a.bind(url_a, CodecKind::Binary).await.expect("bind a");
    server_b.bind(url_b, CodecKind::Binary).await.expect("bind b");
    let _ = server_a.register_service("Foo", Arc::new(TagService { tag: "a" }));
    let _ = server_b.register_service("Foo", Arc::new(TagService { tag: "b" }));

    server_a
        .register_instance(NAME, &[url_a.to_string()])
        .await
        .expect("register a");
    server_b
        .register_instance(NAME, &[url_b.to_string()])
        .await
        .expect("register b");

    let router = client
        .open_router(NAME, RoutePolicy::RoundRobin, CodecKind::Binary)
        .await
        .expect("router");
    assert!(
        wait_until(Duration::from_secs(2), || router.endpoint_count() == 2).await,
        "router must see both instances"
    );

    // Round robin alternates across the two live endpoints.
    let mut tags = Vec::new();
    for _ in 0..4 {
        let h = router.get_route(0).expect("route");
        let reply = client
            .engine()
            .call(h, "Foo:echo", b"ping", 5_000)
            .await
            .expect("call");
        tags.push(reply[0]);
    }
    tags.sort_unstable();
    tags.dedup();
    assert_eq!(tags, vec![b'a', b'b']);

    // Kill A: its registration disappears, the watch fires, the router
    // shrinks to B.
    server_a
        .naming()
        .unregister(NAME, server_a.config().app.instance_id)
        .await
        .expect("unregister a");
    server_a.quit_token().cancel();

    assert!(
        wait_until(Duration::from_secs(2), || router.endpoint_count() == 1).await,
        "router must drop the dead instance"
    );

    // The counter keeps advancing but every pick lands on B.
    for _ in 0..3 {
        let h = router.get_route(0).expect("route after failover");
        let reply = client
            .engine()
            .call(h, "Foo:echo", b"ping", 5_000)
            .await
            .expect("call after failover");
        assert_eq!(reply[0], b'b');
    }
}
