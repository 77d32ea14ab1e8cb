// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;
use weft::{
    codec::{CodecKind, RpcException},
    error::{ErrorCode, RpcError},
    naming::memory::MemoryStore,
    rpc::{RequestCtx, ServiceHandler},
};

use super::common::{start_node, test_config, wait_until};

struct SlowService;

#[async_trait]
impl ServiceHandler for SlowService {
    async fn call(
        &self,
        _method: &str,
        payload: Bytes,
        _ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        sleep(Duration::from_millis(500)).await;
        Ok(payload)
    }
}

#[tokio::test]
async fn short_timeout_fires_and_late_reply_is_dropped() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(1, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(2, ""), Arc::clone(&store)).await;

    let listen = "tcp://127.0.0.1:19111";
    server
        .bind(listen, CodecKind::Binary)
        .await
        .expect("server bind");
    let _ = server.register_service("Slow", Arc::new(SlowService));

    let h = client
        .connect(listen, CodecKind::Binary)
        .await
        .expect("client connect");

    let err = client
        .engine()
        .call(h, "Slow:op", b"x", 100)
        .await
        .expect_err("must time out");
    assert_eq!(err.error_code, RpcError::RequestTimeout.code());

    // The session is gone the moment the timeout callback fired.
    assert_eq!(client.engine().session_count(), 0);

    // Let the real reply arrive; it must be dropped without any effect.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(client.engine().session_count(), 0);

    // The engine is still healthy: a fresh call with enough budget works.
    let reply = client
        .engine()
        .call(h, "Slow:op", b"again", 5_000)
        .await
        .expect("second call succeeds");
    assert_eq!(reply.as_ref(), b"again");

    assert!(
        wait_until(Duration::from_secs(1), || {
            server.engine().session_count() == 0 && server.tasks().len() == 0
        })
        .await
    );
}
