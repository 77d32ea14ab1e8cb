// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;
use weft::{
    cfg::config::{AppConfig, BroadcastSection, Config, NamingSection, RpcSection, TransportSection},
    codec::RpcException,
    naming::{memory::MemoryStore, store::CoordStore},
    node::Node,
    rpc::{RequestCtx, ServiceHandler},
};

/// Builds a config without touching the filesystem.
pub fn test_config(instance_id: u64, relay_url: &str) -> Config {
    let mut cfg = Config {
        app: AppConfig {
            app_id: "demo".to_string(),
            app_key: String::new(),
            instance_id,
            coord_addr: String::new(),
        },
        transport: TransportSection::default(),
        rpc: RpcSection::default(),
        naming: NamingSection::default(),
        broadcast: BroadcastSection { relay_url: relay_url.to_string() },
    };
    cfg.validate_and_normalize().expect("valid test config");
    cfg
}

/// Builds a node on the shared store and spawns its serve loop.
pub async fn start_node(cfg: Config, store: Arc<MemoryStore>) -> Arc<Node> {
    let node = Node::new(cfg, store as Arc<dyn CoordStore>)
        .await
        .expect("node construction");
    let serving = Arc::clone(&node);
    tokio::spawn(async move {
        serving.serve().await;
    });
    node
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where F: FnMut() -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Echoes the payload back, prefixed with a per-server tag so tests can
/// tell which instance answered.
pub struct TagService {
    pub tag: &'static str,
}

#[async_trait]
impl ServiceHandler for TagService {
    async fn call(
        &self,
        method: &str,
        payload: Bytes,
        _ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        match method {
            "echo" => {
                let mut out = Vec::with_capacity(self.tag.len() + 1 + payload.len());
                out.extend_from_slice(self.tag.as_bytes());
                out.push(b':');
                out.extend_from_slice(&payload);
                Ok(Bytes::from(out))
            },
            _ => Err(RpcException::new(-4006, "rpc: unsupported function name")),
        }
    }
}
