// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use weft::{
    codec::CodecKind,
    ctrl::{CtrlRequest, CtrlResponse},
    naming::memory::MemoryStore,
};

use super::common::{start_node, test_config, wait_until};

async fn run_command(
    client: &Arc<weft::node::Node>,
    url: &str,
    command: &str,
    options: Vec<String>,
) -> CtrlResponse {
    let h = client
        .connect(url, CodecKind::Json)
        .await
        .expect("control connect");
    let request = CtrlRequest { command: command.to_string(), options };
    let payload = serde_json::to_vec(&request).expect("encode request");
    let reply = client
        .engine()
        .call(h, "_CtrlCmd:run", &payload, 5_000)
        .await
        .expect("control reply");
    client.transport().close(h);
    serde_json::from_slice(&reply).expect("decode response")
}

#[tokio::test]
async fn stat_help_and_quit_work_over_json() {
    let store = MemoryStore::shared();
    let server = start_node(test_config(1, ""), Arc::clone(&store)).await;
    let client = start_node(test_config(2, ""), Arc::clone(&store)).await;

    let ctrl_listen = "tcp://127.0.0.1:19161";
    server
        .bind(ctrl_listen, CodecKind::Json)
        .await
        .expect("ctrl bind");

    let resp = run_command(&client, ctrl_listen, "stat", vec![]).await;
    assert_eq!(resp.ret_code, 0);
    assert!(resp.data.contains("sessions="), "stat dump: {}", resp.data);
    assert!(resp.data.contains("connections="));

    let resp = run_command(&client, ctrl_listen, "help", vec![]).await;
    assert_eq!(resp.ret_code, 0);
    for builtin in ["help", "quit", "reload", "stat"] {
        assert!(resp.data.contains(builtin), "help must list {builtin}");
    }

    let resp = run_command(&client, ctrl_listen, "no-such-command", vec![]).await;
    assert_ne!(resp.ret_code, 0);

    // User-registered commands are callable like built-ins.
    server
        .ctrl()
        .register_command("ping", "reply with pong", Arc::new(|_: &[String]| Ok("pong".to_string())))
        .expect("register command");
    let resp = run_command(&client, ctrl_listen, "ping", vec![]).await;
    assert_eq!(resp.ret_code, 0);
    assert_eq!(resp.data, "pong");

    // quit stops the server loop.
    let resp = run_command(&client, ctrl_listen, "quit", vec![]).await;
    assert_eq!(resp.ret_code, 0);
    assert!(
        wait_until(Duration::from_secs(1), || server.quit_token().is_cancelled()).await,
        "quit must cancel the serve loop"
    );
}
