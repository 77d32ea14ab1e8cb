// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Demo server: an echo service over framed TCP plus the JSON control
//! service, backed by the in-process coordination store.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;
use weft::{
    cfg::{cli::config_path_from_args, config::Config, logger::init_logger},
    codec::{CodecKind, RpcException},
    ctrl::CTRL_SERVICE,
    error::RpcError,
    naming::memory::MemoryStore,
    node::Node,
    rpc::{RequestCtx, ServiceHandler},
};

struct EchoService;

#[async_trait]
impl ServiceHandler for EchoService {
    async fn call(
        &self,
        method: &str,
        payload: Bytes,
        _ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        match method {
            "echo" => Ok(payload),
            _ => Err(RpcException::from(RpcError::UnsupportedFunctionName)),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _logger_guard = if Path::new("weft_logger.yaml").exists() {
        Some(init_logger("weft_logger.yaml")?)
    } else {
        None
    };

    let cfg_path = config_path_from_args(std::env::args().skip(1))
        .context("pass a config file or provide weft.yaml")?;
    let cfg = Config::load_from_file(&cfg_path)?;

    let store = MemoryStore::shared();
    let node = Node::new(cfg, store).await?;

    let listen = "tcp://127.0.0.1:18001";
    node.bind(listen, CodecKind::Binary).await.map_err(|e| {
        anyhow::anyhow!("bind {listen} failed: {e}")
    })?;
    let ctrl_listen = "tcp://127.0.0.1:18002";
    node.bind(ctrl_listen, CodecKind::Json).await.map_err(|e| {
        anyhow::anyhow!("bind {ctrl_listen} failed: {e}")
    })?;

    let _ = node.register_service("Echo", Arc::new(EchoService));
    info!(%listen, %ctrl_listen, service = CTRL_SERVICE, "echo server ready");

    node.serve().await;
    Ok(())
}
