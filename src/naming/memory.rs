// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! In-process coordination store with full ephemeral/watch/session
//! semantics. Backs tests and demos, and serves single-process
//! deployments that do not need an external store.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    error::StoreError,
    naming::store::{
        CoordStore, NodeStat, SessionEvent, StoreResult, WatchEvent, Watcher, join_path,
        parent_of, validate_path,
    },
};

#[derive(Debug)]
struct MemNode {
    data: Vec<u8>,
    ephemeral: bool,
    owner_epoch: u64,
    stat: NodeStat,
}

#[derive(Default)]
struct WatchMap {
    /// get/exists watches: fire on create, data change, delete.
    data: HashMap<String, Vec<Watcher>>,
    /// get_children watches: fire on child-set change.
    children: HashMap<String, Vec<Watcher>>,
}

pub struct MemoryStore {
    nodes: Mutex<BTreeMap<String, MemNode>>,
    watches: Mutex<WatchMap>,
    session_tx: broadcast::Sender<SessionEvent>,
    epoch: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            watches: Mutex::new(WatchMap::default()),
            session_tx,
            epoch: AtomicU64::new(1),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulates a session expiry: every ephemeral owned by the current
    /// epoch disappears (watches fire), then the session reconnects under
    /// a new epoch. Clients are expected to restore their state on the
    /// `Reconnected` event.
    pub fn expire_session(&self) {
        let _ = self.session_tx.send(SessionEvent::Expired);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);

        let doomed: Vec<String> = {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes
                .iter()
                .filter(|(_, n)| n.ephemeral && n.owner_epoch == epoch)
                .map(|(p, _)| p.clone())
                .collect()
        };
        for path in doomed {
            debug!(%path, "ephemeral removed by session expiry");
            let _ = self.remove_node(&path);
        }

        let _ = self.session_tx.send(SessionEvent::Reconnected);
    }

    fn remove_node(&self, path: &str) -> StoreResult<()> {
        let parent = parent_of(path).to_string();
        {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            if nodes.remove(path).is_none() {
                return Err(StoreError::NoNode);
            }
            if let Some(p) = nodes.get_mut(&parent) {
                p.stat.cversion += 1;
            }
        }
        self.fire_data(path, WatchEvent::NodeDeleted(path.to_string()));
        self.fire_children(&parent, WatchEvent::ChildrenChanged(parent.clone()));
        Ok(())
    }

    fn fire_data(&self, path: &str, event: WatchEvent) {
        let fired = {
            let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
            watches.data.remove(path).unwrap_or_default()
        };
        for w in fired {
            w(event.clone());
        }
    }

    fn fire_children(&self, path: &str, event: WatchEvent) {
        let fired = {
            let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
            watches.children.remove(path).unwrap_or_default()
        };
        for w in fired {
            w(event.clone());
        }
    }

    fn arm_data(&self, path: &str, watch: Option<Watcher>) {
        if let Some(w) = watch {
            self.watches
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .data
                .entry(path.to_string())
                .or_default()
                .push(w);
        }
    }

    fn arm_children(&self, path: &str, watch: Option<Watcher>) {
        if let Some(w) = watch {
            self.watches
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .children
                .entry(path.to_string())
                .or_default()
                .push(w);
        }
    }

    fn child_names(nodes: &BTreeMap<String, MemNode>, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p[prefix.len()..].to_string())
            .collect()
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn add_auth(&self, _scheme: &str, _credential: &str) -> StoreResult<()> {
        // The in-process store trusts its process.
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> StoreResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(StoreError::NodeExists);
        }
        let parent = parent_of(path).to_string();
        {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            if nodes.contains_key(path) {
                return Err(StoreError::NodeExists);
            }
            if parent != "/" {
                let p = nodes.get_mut(&parent).ok_or(StoreError::NoNode)?;
                if p.ephemeral {
                    // Ephemerals are always leaves.
                    return Err(StoreError::InvalidParam);
                }
                p.stat.cversion += 1;
            }
            nodes.insert(path.to_string(), MemNode {
                data: data.to_vec(),
                ephemeral,
                owner_epoch: self.epoch.load(Ordering::SeqCst),
                stat: NodeStat::default(),
            });
        }
        self.fire_data(path, WatchEvent::NodeCreated(path.to_string()));
        self.fire_children(&parent, WatchEvent::ChildrenChanged(parent.clone()));
        Ok(())
    }

    async fn delete(&self, path: &str, version: i64) -> StoreResult<()> {
        validate_path(path)?;
        {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = nodes.get(path).ok_or(StoreError::NoNode)?;
            if version >= 0 && version != node.stat.data_version {
                return Err(StoreError::BadVersion);
            }
            if !Self::child_names(&nodes, path).is_empty() {
                return Err(StoreError::InvalidParam);
            }
        }
        self.remove_node(path)
    }

    async fn get(&self, path: &str, watch: Option<Watcher>) -> StoreResult<(Vec<u8>, NodeStat)> {
        validate_path(path)?;
        let result = {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = nodes.get(path).ok_or(StoreError::NoNode)?;
            (node.data.clone(), node.stat)
        };
        self.arm_data(path, watch);
        Ok(result)
    }

    async fn set(&self, path: &str, data: &[u8], version: i64) -> StoreResult<NodeStat> {
        validate_path(path)?;
        let stat = {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = nodes.get_mut(path).ok_or(StoreError::NoNode)?;
            if version >= 0 && version != node.stat.data_version {
                return Err(StoreError::BadVersion);
            }
            node.data = data.to_vec();
            node.stat.data_version += 1;
            node.stat
        };
        self.fire_data(path, WatchEvent::NodeDataChanged(path.to_string()));
        Ok(stat)
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> StoreResult<(Vec<String>, NodeStat)> {
        validate_path(path)?;
        let result = {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let stat = if path == "/" {
                NodeStat::default()
            } else {
                nodes.get(path).ok_or(StoreError::NoNode)?.stat
            };
            (Self::child_names(&nodes, path), stat)
        };
        self.arm_children(path, watch);
        Ok(result)
    }

    async fn exists(&self, path: &str, watch: Option<Watcher>) -> StoreResult<Option<NodeStat>> {
        validate_path(path)?;
        let stat = {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes.get(path).map(|n| n.stat)
        };
        self.arm_data(path, watch);
        Ok(stat)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn create_requires_parent() {
        let store = MemoryStore::new();
        assert_eq!(
            store.create("/a/b", b"", false).await,
            Err(StoreError::NoNode)
        );
        store.create("/a", b"", false).await.expect("create /a");
        store.create("/a/b", b"x", false).await.expect("create /a/b");
        assert_eq!(
            store.create("/a/b", b"", false).await,
            Err(StoreError::NodeExists)
        );
    }

    #[tokio::test]
    async fn cversion_tracks_child_churn() {
        let store = MemoryStore::new();
        store.create("/svc", b"", false).await.expect("dir");
        let (_, s0) = store.get_children("/svc", None).await.expect("children");
        assert_eq!(s0.cversion, 0);

        store.create("/svc/1", b"", false).await.expect("child");
        store.create("/svc/2", b"", false).await.expect("child");
        store.delete("/svc/1", -1).await.expect("delete");
        let (names, s1) = store.get_children("/svc", None).await.expect("children");
        assert_eq!(names, vec!["2".to_string()]);
        assert_eq!(s1.cversion, 3);
    }

    #[tokio::test]
    async fn watches_are_one_shot() {
        let store = MemoryStore::new();
        store.create("/n", b"v0", false).await.expect("create");

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        store
            .get("/n", Some(Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            })))
            .await
            .expect("get with watch");

        store.set("/n", b"v1", -1).await.expect("set");
        store.set("/n", b"v2", -1).await.expect("set");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiry_removes_only_current_epoch_ephemerals() {
        let store = MemoryStore::new();
        store.create("/d", b"", false).await.expect("dir");
        store.create("/d/e", b"", true).await.expect("ephemeral");
        store.create("/d/p", b"", false).await.expect("persistent");

        store.expire_session();
        assert_eq!(store.exists("/d/e", None).await.expect("exists"), None);
        assert!(store.exists("/d/p", None).await.expect("exists").is_some());

        // Ephemerals created after reconnecting belong to the new epoch.
        store.create("/d/e2", b"", true).await.expect("ephemeral");
        assert!(store.exists("/d/e2", None).await.expect("exists").is_some());
    }

    #[tokio::test]
    async fn delete_respects_version() {
        let store = MemoryStore::new();
        store.create("/n", b"a", false).await.expect("create");
        store.set("/n", b"b", -1).await.expect("set");
        assert_eq!(store.delete("/n", 0).await, Err(StoreError::BadVersion));
        store.delete("/n", 1).await.expect("delete at right version");
    }
}
