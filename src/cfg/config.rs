// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Process configuration: YAML file, optionally overridden by the
//! `WEFT_ENV` environment variable (a JSON object seeding app identity
//! and the coordination-store address, for containerized deployments
//! where the file is baked into the image).

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::{broadcast::BroadcastConfig, naming::NamingConfig, transport::TransportConfig};

/// Environment override variable; value is JSON.
pub const ENV_VAR: &str = "WEFT_ENV";

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// App identity and the coordination store to register against.
    pub app: AppConfig,
    /// Wire-transport limits and timeouts.
    #[serde(default)]
    pub transport: TransportSection,
    /// RPC engine knobs.
    #[serde(default)]
    pub rpc: RpcSection,
    /// Naming cache windows.
    #[serde(default)]
    pub naming: NamingSection,
    /// Broadcast relay endpoint.
    #[serde(default)]
    pub broadcast: BroadcastSection,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(rename = "AppId")]
    /// Root of this app's sub-tree in the coordination store (mandatory).
    pub app_id: String,

    #[serde(default, rename = "AppKey")]
    /// Secret for the digest credential; empty disables authentication.
    pub app_key: String,

    #[serde(default, rename = "InstanceId")]
    /// Identity of this process among the instances of a service; 0 picks
    /// a random id at startup.
    pub instance_id: u64,

    #[serde(default, rename = "CoordAddress")]
    /// Coordination-store address; informational for in-process stores.
    pub coord_addr: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportSection {
    #[serde(default = "default_recv_buffer_limit", rename = "RecvBufferLimit")]
    /// Largest accepted frame payload in bytes.
    pub recv_buffer_limit: usize,

    #[serde(default = "default_send_queue_limit", rename = "SendQueueLimit")]
    /// Outbound queue depth per handle; sends fail fast when full.
    pub send_queue_limit: usize,

    #[serde(default = "default_reconnect_attempts", rename = "ReconnectAttempts")]
    /// Reconnects for client TCP handles before the error surfaces.
    pub reconnect_attempts: u32,

    #[serde(default = "default_idle_timeout", rename = "IdleTimeout", with = "serde_secs")]
    /// Peers idle past this are closed (seconds).
    pub idle_timeout: Duration,

    #[serde(default = "default_connect_timeout", rename = "ConnectTimeout", with = "serde_secs")]
    /// TCP connect / reconnect budget (seconds).
    pub connect_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcSection {
    #[serde(default = "default_timeout_ms", rename = "DefaultTimeoutMs")]
    /// Applied when a request passes no (or a non-positive) timeout.
    pub default_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NamingSection {
    #[serde(default = "default_refresh_ms", rename = "RefreshMs")]
    /// Cache entries younger than this are served without a store read.
    pub refresh_ms: u64,

    #[serde(default = "default_invalid_ms", rename = "InvalidMs")]
    /// Cache entries older than this are discarded outright.
    pub invalid_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct BroadcastSection {
    #[serde(default, rename = "RelayUrl")]
    /// URL peer servers use to reach this server's relay listener; empty
    /// disables the relay side of broadcast.
    pub relay_url: String,
}

fn default_recv_buffer_limit() -> usize {
    2 * 1024 * 1024
}
fn default_send_queue_limit() -> usize {
    10_000
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(100)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_timeout_ms() -> u64 {
    crate::rpc::DEFAULT_TIMEOUT_MS
}
fn default_refresh_ms() -> u64 {
    300_000
}
fn default_invalid_ms() -> u64 {
    330_000
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            recv_buffer_limit: default_recv_buffer_limit(),
            send_queue_limit: default_send_queue_limit(),
            reconnect_attempts: default_reconnect_attempts(),
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for RpcSection {
    fn default() -> Self {
        Self { default_timeout_ms: default_timeout_ms() }
    }
}

impl Default for NamingSection {
    fn default() -> Self {
        Self { refresh_ms: default_refresh_ms(), invalid_ms: default_invalid_ms() }
    }
}

/// Fields `WEFT_ENV` may seed.
#[derive(Deserialize, Debug, Default)]
struct EnvSeed {
    app_id: Option<String>,
    app_key: Option<String>,
    coord_addr: Option<String>,
}

impl Config {
    /// Loads from YAML, applies the environment override, validates, and
    /// normalizes derived fields.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&raw).context("failed to parse config YAML")?;
        cfg.apply_env_override()?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    fn apply_env_override(&mut self) -> Result<()> {
        let Ok(value) = std::env::var(ENV_VAR) else {
            return Ok(());
        };
        let seed: EnvSeed = serde_json::from_str(&value)
            .with_context(|| format!("failed to parse {ENV_VAR} as JSON"))?;
        if let Some(app_id) = seed.app_id {
            self.app.app_id = app_id;
        }
        if let Some(app_key) = seed.app_key {
            self.app.app_key = app_key;
        }
        if let Some(coord_addr) = seed.coord_addr {
            self.app.coord_addr = coord_addr;
        }
        Ok(())
    }

    /// Validates invariants and fills derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.app.app_id.is_empty(), "AppId must not be empty");
        ensure!(
            !self.app.app_id.contains('/'),
            "AppId must not contain '/'"
        );
        ensure!(
            self.transport.send_queue_limit >= 1,
            "SendQueueLimit must be >= 1"
        );
        ensure!(
            self.transport.recv_buffer_limit >= 1024,
            "RecvBufferLimit must be >= 1024"
        );
        ensure!(
            self.naming.invalid_ms >= self.naming.refresh_ms,
            "InvalidMs must be >= RefreshMs"
        );

        if self.app.instance_id == 0 {
            self.app.instance_id = rand::rng().random();
        }
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            recv_buffer_limit: self.transport.recv_buffer_limit,
            send_queue_limit: self.transport.send_queue_limit,
            reconnect_attempts: self.transport.reconnect_attempts,
            idle_timeout: self.transport.idle_timeout,
            connect_timeout: self.transport.connect_timeout,
        }
    }

    pub fn naming_config(&self) -> NamingConfig {
        NamingConfig {
            refresh: Duration::from_millis(self.naming.refresh_ms),
            invalid: Duration::from_millis(self.naming.invalid_ms),
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            app_id: self.app.app_id.clone(),
            relay_url: self.broadcast.relay_url.clone(),
            instance_id: self.app.instance_id,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.default_timeout_ms)
    }
}

/// Serde helpers representing `Duration` as whole seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "app:\n  AppId: demo\n";

    #[test]
    fn minimal_yaml_gets_defaults() {
        let mut cfg: Config = serde_yaml::from_str(MINIMAL).expect("parse");
        cfg.validate_and_normalize().expect("validate");

        assert_eq!(cfg.transport.send_queue_limit, 10_000);
        assert_eq!(cfg.transport.recv_buffer_limit, 2 * 1024 * 1024);
        assert_eq!(cfg.transport.reconnect_attempts, 3);
        assert_eq!(cfg.transport.idle_timeout, Duration::from_secs(100));
        assert_eq!(cfg.rpc.default_timeout_ms, 60_000);
        assert_eq!(cfg.naming.refresh_ms, 300_000);
        assert_eq!(cfg.naming.invalid_ms, 330_000);
        assert_ne!(cfg.app.instance_id, 0, "instance id must be seeded");
    }

    #[test]
    fn explicit_values_survive() {
        let yaml = "app:\n  AppId: demo\n  InstanceId: 42\ntransport:\n  IdleTimeout: 7\n  SendQueueLimit: 5\n";
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.app.instance_id, 42);
        assert_eq!(cfg.transport.idle_timeout, Duration::from_secs(7));
        assert_eq!(cfg.transport.send_queue_limit, 5);
    }

    #[test]
    fn bad_cache_windows_are_rejected() {
        let yaml = "app:\n  AppId: demo\nnaming:\n  RefreshMs: 1000\n  InvalidMs: 500\n";
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn empty_app_id_is_rejected() {
        let mut cfg: Config = serde_yaml::from_str("app:\n  AppId: \"\"\n").expect("parse");
        assert!(cfg.validate_and_normalize().is_err());
    }
}
