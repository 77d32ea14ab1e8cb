// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! The coordination-store contract.
//!
//! The naming layer only assumes an async hierarchical KV with ephemeral
//! nodes, one-shot watches that fire after any matching mutation, and a
//! session-event stream. A production deployment implements this trait
//! over its store of choice; [`MemoryStore`](super::memory::MemoryStore)
//! implements it in-process.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Node metadata used for change detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStat {
    /// Bumped whenever the node's child set changes.
    pub cversion: i64,
    /// Bumped whenever the node's data changes.
    pub data_version: i64,
}

/// Fired at most once per registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated(String),
    NodeDeleted(String),
    NodeDataChanged(String),
    ChildrenChanged(String),
}

/// Store-session lifecycle. `Expired` invalidates ephemerals; the naming
/// layer restores its state on `Reconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Expired,
    Reconnected,
}

/// One-shot watch callback.
pub type Watcher = Box<dyn FnOnce(WatchEvent) + Send>;

#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Installs a credential for subsequent operations.
    /// For `scheme = "digest"` the credential is
    /// `"<user>:<base64(sha1(user:secret))>"`.
    async fn add_auth(&self, scheme: &str, credential: &str) -> StoreResult<()>;

    /// Creates a node. The parent must exist. Ephemeral nodes disappear
    /// when the creating session dies.
    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> StoreResult<()>;

    /// Deletes a node. `version < 0` skips the version check.
    async fn delete(&self, path: &str, version: i64) -> StoreResult<()>;

    /// Reads a node's value; an attached watch fires on the node's next
    /// data change or deletion.
    async fn get(&self, path: &str, watch: Option<Watcher>) -> StoreResult<(Vec<u8>, NodeStat)>;

    /// Writes a node's value. `version < 0` skips the version check.
    async fn set(&self, path: &str, data: &[u8], version: i64) -> StoreResult<NodeStat>;

    /// Lists child names (not paths); an attached watch fires on the next
    /// child-set change.
    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> StoreResult<(Vec<String>, NodeStat)>;

    /// Existence probe; an attached watch fires on creation, deletion, or
    /// data change.
    async fn exists(&self, path: &str, watch: Option<Watcher>) -> StoreResult<Option<NodeStat>>;

    /// Subscribes to session lifecycle notifications.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Path sanity shared by implementations: absolute, no empty segments,
/// no trailing slash (the root `"/"` itself is implicit and valid).
pub fn validate_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(StoreError::InvalidParam);
    }
    if path.split('/').skip(1).any(str::is_empty) {
        return Err(StoreError::InvalidParam);
    }
    Ok(())
}

/// Parent path, with `"/"` for a first-level node.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Last path segment.
pub fn leaf_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
