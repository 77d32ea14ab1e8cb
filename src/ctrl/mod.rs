// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! The control-command service.
//!
//! Exposed as a JSON-codec RPC service so any client, including a
//! one-line script over the HTTP transport, can drive it. Requests are
//! `{command, options?}`, replies `{ret_code, data}`. `reload` and
//! `stat` are installed by the node with closures over the live
//! subsystems; `help` and `quit` are built in.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    codec::RpcException,
    error::{ErrorCode, RpcError},
    rpc::{RequestCtx, ServiceHandler},
};

/// Service and method names on the wire.
pub const CTRL_SERVICE: &str = "_CtrlCmd";
pub const CTRL_METHOD: &str = "run";

#[derive(Debug, Serialize, Deserialize)]
pub struct CtrlRequest {
    pub command: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CtrlResponse {
    pub ret_code: i32,
    pub data: String,
}

/// A command implementation: options in, printable output or error text
/// out.
pub type CommandFn = Arc<dyn Fn(&[String]) -> Result<String, String> + Send + Sync>;

struct CommandEntry {
    help: String,
    run: CommandFn,
}

pub struct CtrlService {
    commands: DashMap<String, CommandEntry>,
    quit: CancellationToken,
}

impl CtrlService {
    /// Cancelling `quit` is how the `quit` command stops the serve loop.
    pub fn new(quit: CancellationToken) -> Arc<Self> {
        let ctrl = Arc::new(Self { commands: DashMap::new(), quit });

        let quit_token = ctrl.quit.clone();
        let _ = ctrl.register_command(
            "quit",
            "stop the server process",
            Arc::new(move |_opts: &[String]| {
                info!("quit requested via control command");
                quit_token.cancel();
                Ok("bye".to_string())
            }),
        );
        ctrl
    }

    /// Adds a command. Names are unique; re-registration is refused.
    pub fn register_command(
        &self,
        name: &str,
        help: &str,
        run: CommandFn,
    ) -> Result<(), RpcError> {
        if name.is_empty() {
            return Err(RpcError::InvalidParam);
        }
        if self.commands.contains_key(name) {
            return Err(RpcError::FunctionNameExisted);
        }
        self.commands.insert(name.to_string(), CommandEntry {
            help: help.to_string(),
            run,
        });
        Ok(())
    }

    pub fn run(&self, command: &str, options: &[String]) -> CtrlResponse {
        if command == "help" {
            return CtrlResponse { ret_code: 0, data: self.help_text() };
        }
        let Some(entry) = self.commands.get(command) else {
            return CtrlResponse {
                ret_code: RpcError::UnsupportedFunctionName.code(),
                data: format!("unknown command {command:?}; try \"help\""),
            };
        };
        match (entry.run)(options) {
            Ok(data) => CtrlResponse { ret_code: 0, data },
            Err(message) => CtrlResponse {
                ret_code: crate::error::SYSTEM_ERROR,
                data: message,
            },
        }
    }

    fn help_text(&self) -> String {
        let mut lines: Vec<String> = self
            .commands
            .iter()
            .map(|e| format!("{:<12} {}", e.key(), e.value().help))
            .collect();
        lines.push(format!("{:<12} {}", "help", "list available commands"));
        lines.sort();
        lines.join("\n")
    }
}

#[async_trait]
impl ServiceHandler for CtrlService {
    async fn call(
        &self,
        method: &str,
        payload: Bytes,
        _ctx: RequestCtx,
    ) -> Result<Bytes, RpcException> {
        if method != CTRL_METHOD {
            return Err(RpcException::from(RpcError::UnsupportedFunctionName));
        }
        let request: CtrlRequest = serde_json::from_slice(&payload)
            .map_err(|_| RpcException::from(RpcError::DecodeFailed))?;
        let response = self.run(&request.command, &request.options);
        serde_json::to_vec(&response)
            .map(Bytes::from)
            .map_err(|_| RpcException::from(RpcError::EncodeFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_reports_code() {
        let ctrl = CtrlService::new(CancellationToken::new());
        let resp = ctrl.run("nope", &[]);
        assert_eq!(resp.ret_code, RpcError::UnsupportedFunctionName.code());
    }

    #[test]
    fn help_lists_registered_commands() {
        let ctrl = CtrlService::new(CancellationToken::new());
        ctrl.register_command("stat", "dump runtime counters", Arc::new(|_: &[String]| Ok(String::new())))
            .expect("register");
        let resp = ctrl.run("help", &[]);
        assert_eq!(resp.ret_code, 0);
        assert!(resp.data.contains("stat"));
        assert!(resp.data.contains("quit"));
        assert!(resp.data.contains("help"));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let ctrl = CtrlService::new(CancellationToken::new());
        ctrl.register_command("x", "", Arc::new(|_: &[String]| Ok(String::new())))
            .expect("register");
        assert_eq!(
            ctrl.register_command("x", "", Arc::new(|_: &[String]| Ok(String::new()))),
            Err(RpcError::FunctionNameExisted)
        );
    }

    #[test]
    fn quit_cancels_the_token() {
        let token = CancellationToken::new();
        let ctrl = CtrlService::new(token.clone());
        let resp = ctrl.run("quit", &[]);
        assert_eq!(resp.ret_code, 0);
        assert!(token.is_cancelled());
    }

    #[test]
    fn options_reach_the_command() {
        let ctrl = CtrlService::new(CancellationToken::new());
        ctrl.register_command(
            "echo",
            "echo options",
            Arc::new(|opts: &[String]| Ok(opts.join(" "))),
        )
        .expect("register");
        let resp = ctrl.run("echo", &["a".into(), "b".into()]);
        assert_eq!(resp.data, "a b");
    }
}
