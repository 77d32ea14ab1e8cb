// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serial_test::serial;
use tokio::time::sleep;
use weft::{
    codec::{CodecKind, RpcException},
    naming::memory::MemoryStore,
    node::Node,
    rpc::{RequestCtx, ServiceHandler},
};

use super::common::{start_node, test_config, wait_until};

const CHANNEL: &str = "room";

/// Server-side: a client calls `Room:join` and its connection handle
/// becomes a channel subscriber.
struct RoomService {
    node: std::sync::Weak<Node>,
}

#[async_trait]
impl ServiceHandler for RoomService {
    async fn call(
        &self,
        method: &str,
        _payload: Bytes,
        ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        if method != "join" {
            return Err(RpcException::new(-4006, "rpc: unsupported function name"));
        }
        let node = self
            .node
            .upgrade()
            .ok_or_else(|| RpcException::new(-4011, "rpc: system error"))?;
        node.channels()
            .join_channel(CHANNEL, ctx.handle)
            .map_err(RpcException::from)?;
        Ok(Bytes::new())
    }
}

/// Client-side sink counting broadcast deliveries.
struct ChatSink {
    hits: Arc<AtomicUsize>,
    last: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[async_trait]
impl ServiceHandler for ChatSink {
    async fn call(
        &self,
        _method: &str,
        payload: Bytes,
        _ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().expect("lock") = payload.to_vec();
        Ok(Bytes::new())
    }
}

fn sink() -> (Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<u8>>>, Arc<ChatSink>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(std::sync::Mutex::new(Vec::new()));
    let service = Arc::new(ChatSink { hits: Arc::clone(&hits), last: Arc::clone(&last) });
    (hits, last, service)
}

#[tokio::test]
#[serial]
async fn fan_out_reaches_local_and_relayed_subscribers_once() {
    let store = MemoryStore::shared();

    // Two servers, each with a relay listener peers can dial.
    let s1 = start_node(test_config(1, "tcp://127.0.0.1:19143"), Arc::clone(&store)).await;
    let s2 = start_node(test_config(2, "tcp://127.0.0.1:19144"), Arc::clone(&store)).await;
    let c1 = start_node(test_config(3, ""), Arc::clone(&store)).await;
    let c2 = start_node(test_config(4, ""), Arc::clone(&store)).await;

    let listen1 = "tcp://127.0.0.1:19141";
    let listen2 = "tcp://127.0.0.1:19142";
    s1.bind(listen1, CodecKind::Binary).await.expect("bind s1");
    s2.bind(listen2, CodecKind::Binary).await.expect("bind s2");
    let _ = s1.register_service("Room", Arc::new(RoomService { node: Arc::downgrade(&s1) }));
    let _ = s2.register_service("Room", Arc::new(RoomService { node: Arc::downgrade(&s2) }));

    s1.channels().open_channel(CHANNEL).await.expect("open on s1");
    s2.channels().open_channel(CHANNEL).await.expect("open on s2");

    // Each server discovers the other's relay through naming.
    assert!(
        wait_until(Duration::from_secs(2), || {
            s1.channels().peer_count(CHANNEL) == 1 && s2.channels().peer_count(CHANNEL) == 1
        })
        .await,
        "peers must discover each other"
    );

    // Clients join their respective servers.
    let (hits1, last1, sink1) = sink();
    let (hits2, last2, sink2) = sink();
    let _ = c1.register_service("Chat", sink1);
    let _ = c2.register_service("Chat", sink2);

    let h1 = c1.connect(listen1, CodecKind::Binary).await.expect("c1 connect");
    let h2 = c2.connect(listen2, CodecKind::Binary).await.expect("c2 connect");
    c1.engine().call(h1, "Room:join", b"", 5_000).await.expect("c1 join");
    c2.engine().call(h2, "Room:join", b"", 5_000).await.expect("c2 join");
    assert_eq!(s1.channels().subscriber_count(CHANNEL), 1);
    assert_eq!(s2.channels().subscriber_count(CHANNEL), 1);

    // S1 broadcasts: C1 via the local path, C2 via the S2 relay.
    let sent = s1
        .engine()
        .broadcast_request(CHANNEL, "Chat:deliver", b"m")
        .await
        .expect("broadcast");
    assert_eq!(sent, 2, "one local subscriber plus one peer relay");

    assert!(
        wait_until(Duration::from_secs(2), || {
            hits1.load(Ordering::SeqCst) == 1 && hits2.load(Ordering::SeqCst) == 1
        })
        .await,
        "each client must receive the message"
    );
    assert_eq!(*last1.lock().expect("lock"), b"m".to_vec());
    assert_eq!(*last2.lock().expect("lock"), b"m".to_vec());

    // No echo back to S1 and no duplicate deliveries.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(hits1.load(Ordering::SeqCst), 1);
    assert_eq!(hits2.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn local_only_channel_counts_subscribers() {
    let store = MemoryStore::shared();
    let s1 = start_node(test_config(11, "tcp://127.0.0.1:19148"), Arc::clone(&store)).await;
    let c1 = start_node(test_config(12, ""), Arc::clone(&store)).await;

    let listen = "tcp://127.0.0.1:19147";
    s1.bind(listen, CodecKind::Binary).await.expect("bind");
    let _ = s1.register_service("Room", Arc::new(RoomService { node: Arc::downgrade(&s1) }));
    s1.channels().open_channel(CHANNEL).await.expect("open");

    let (hits, _, sink) = sink();
    let _ = c1.register_service("Chat", sink);
    let h = c1.connect(listen, CodecKind::Binary).await.expect("connect");
    c1.engine().call(h, "Room:join", b"", 5_000).await.expect("join");

    // No peers: the count is exactly the local subscriber count.
    let sent = s1
        .engine()
        .broadcast_request(CHANNEL, "Chat:deliver", b"x")
        .await
        .expect("broadcast");
    assert_eq!(sent, 1);
    assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1).await);

    // Overload refuses broadcasts outright.
    s1.engine().set_overload(1);
    assert!(
        s1.engine()
            .broadcast_request(CHANNEL, "Chat:deliver", b"y")
            .await
            .is_err()
    );
    s1.engine().set_overload(0);
}
