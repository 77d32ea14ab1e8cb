// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Service naming over the coordination store.
//!
//! A service instance registers as an ephemeral leaf
//! `<name>/<instance_id>` whose value is its percent-encoded URL list.
//! Lookups resolve the union of all instance URL lists under a name;
//! `*` inside any path segment matches within that segment only.
//! Watched names keep an always-armed store watch; every fire re-reads
//! the set, refreshes the cache, and invokes the subscribers unless the
//! version string is unchanged.

pub mod memory;
pub mod store;

mod cache;

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    error::{NamingError, StoreError},
    naming::{
        cache::{CacheLookup, UrlCache},
        store::{CoordStore, SessionEvent, join_path, validate_path},
    },
    transport::url::{join_url_list, split_url_list},
};

/// Invoked with the new URL set on every effective change of a watched
/// name.
pub type NameWatchFn = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Naming tuning; defaults match the documented cache windows.
#[derive(Debug, Clone)]
pub struct NamingConfig {
    pub refresh: Duration,
    pub invalid: Duration,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            refresh: Duration::from_secs(300),
            invalid: Duration::from_secs(330),
        }
    }
}

struct AppAuth {
    credential: String,
}

pub struct Naming {
    store: Arc<dyn CoordStore>,
    cache: UrlCache,
    /// Remembered ephemeral registrations: leaf path → node value.
    registered: DashMap<String, Vec<u8>>,
    watched: DashMap<String, Vec<NameWatchFn>>,
    fired_tx: mpsc::UnboundedSender<String>,
    fired_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    session_rx: Mutex<broadcast::Receiver<SessionEvent>>,
    auth: Mutex<Option<AppAuth>>,
}

impl Naming {
    pub fn new(store: Arc<dyn CoordStore>, cfg: NamingConfig) -> Arc<Self> {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let session_rx = store.session_events();
        Arc::new(Self {
            store,
            cache: UrlCache::new(cfg.refresh, cfg.invalid),
            registered: DashMap::new(),
            watched: DashMap::new(),
            fired_tx,
            fired_rx: Mutex::new(fired_rx),
            session_rx: Mutex::new(session_rx),
            auth: Mutex::new(None),
        })
    }

    // ---- credentials ---------------------------------------------------

    /// Installs the digest credential for the app sub-tree:
    /// `app_id:base64(sha1("app_id:app_key"))`.
    pub async fn set_app_info(&self, app_id: &str, app_key: &str) -> Result<(), NamingError> {
        if app_id.is_empty() {
            return Err(NamingError::InvalidParam);
        }
        let password = BASE64.encode(Sha1::digest(format!("{app_id}:{app_key}").as_bytes()));
        let credential = format!("{app_id}:{password}");
        self.store
            .add_auth("digest", &credential)
            .await
            .map_err(|_| NamingError::RegisterFailed)?;
        *self.auth.lock().unwrap_or_else(|e| e.into_inner()) = Some(AppAuth { credential });
        Ok(())
    }

    // ---- registration --------------------------------------------------

    /// Publishes `urls` as instance `instance_id` of `name`. Intermediate
    /// directory nodes are created as needed; the leaf is ephemeral and
    /// remembered for re-creation after a store-session recovery.
    pub async fn register(
        &self,
        name: &str,
        urls: &[String],
        instance_id: u64,
    ) -> Result<(), NamingError> {
        if validate_path(name).is_err() || name == "/" || urls.is_empty() {
            return Err(NamingError::InvalidParam);
        }

        self.ensure_dirs(name).await?;

        let leaf = format!("{name}/{instance_id}");
        let value = join_url_list(urls).into_bytes();
        match self.store.create(&leaf, &value, true).await {
            Ok(()) => {
                info!(path = %leaf, "instance registered");
                self.registered.insert(leaf, value);
                Ok(())
            },
            Err(StoreError::NodeExists) => Err(NamingError::UrlAlreadyRegistered),
            Err(e) => {
                warn!(path = %leaf, code = e as i32, "register failed: {e}");
                Err(NamingError::RegisterFailed)
            },
        }
    }

    /// Removes the instance leaf. Emptied ancestors are deliberately left
    /// in place: other observers may be racing to create siblings.
    pub async fn unregister(&self, name: &str, instance_id: u64) -> Result<(), NamingError> {
        let leaf = format!("{name}/{instance_id}");
        self.registered.remove(&leaf);
        match self.store.delete(&leaf, -1).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode) => Err(NamingError::UrlNotBound),
            Err(_) => Err(NamingError::RegisterFailed),
        }
    }

    async fn ensure_dirs(&self, name: &str) -> Result<(), NamingError> {
        let segments: Vec<&str> = name.split('/').skip(1).collect();
        let mut path = String::new();
        for seg in segments {
            path.push('/');
            path.push_str(seg);
            match self.store.create(&path, b"", false).await {
                Ok(()) | Err(StoreError::NodeExists) => {},
                Err(e) => {
                    warn!(%path, code = e as i32, "mkdir failed: {e}");
                    return Err(NamingError::RegisterFailed);
                },
            }
        }
        Ok(())
    }

    // ---- lookup --------------------------------------------------------

    /// Resolves the union of URL lists of all instances under `name`,
    /// deduplicated. Served from cache inside the refresh window.
    pub async fn get_urls_by_name(&self, name: &str) -> Result<Vec<String>, NamingError> {
        if validate_path(name).is_err() {
            return Err(NamingError::InvalidParam);
        }

        let fallback = match self.cache.get(name) {
            CacheLookup::Fresh(urls) => return Ok(urls),
            CacheLookup::Stale(urls) => Some(urls),
            CacheLookup::Miss => None,
        };

        match self.fetch(name).await {
            Ok((urls, version)) => {
                self.cache.put(name, urls.clone(), version);
                Ok(urls)
            },
            Err(e) => match fallback {
                Some(urls) => {
                    debug!(%name, "lookup failed, serving stale cache");
                    Ok(urls)
                },
                None => Err(e),
            },
        }
    }

    /// Subscribes `f` to changes of the URL set under `name`. The first
    /// subscription arms the watch and primes the cache.
    pub async fn watch_name(&self, name: &str, f: NameWatchFn) -> Result<(), NamingError> {
        if validate_path(name).is_err() || name.contains('*') {
            return Err(NamingError::InvalidParam);
        }
        let newly_watched = {
            let mut entry = self.watched.entry(name.to_string()).or_default();
            entry.push(f);
            entry.len() == 1
        };
        if newly_watched {
            match self.fetch_armed(name).await {
                Ok((urls, version)) => {
                    self.cache.put(name, urls, version);
                },
                Err(e) => {
                    debug!(%name, "initial armed fetch failed: {e:?}");
                },
            }
        }
        Ok(())
    }

    /// Drives watch-fire processing and session recovery. Returns how
    /// many watched names were re-read this tick.
    pub async fn update(&self) -> usize {
        self.drive_session_events().await;

        let mut names = BTreeSet::new();
        {
            let mut rx = self.fired_rx.lock().unwrap_or_else(|e| e.into_inner());
            while let Ok(name) = rx.try_recv() {
                names.insert(name);
            }
        }

        let count = names.len();
        for name in names {
            self.refresh_watched(&name).await;
        }
        count
    }

    async fn refresh_watched(&self, name: &str) {
        let (urls, version) = match self.fetch_armed(name).await {
            Ok(ok) => ok,
            // A deleted name is an effective change to the empty set.
            Err(NamingError::UrlNotBound) => (Vec::new(), "absent".to_string()),
            Err(e) => {
                debug!(%name, "watched re-read failed: {e:?}");
                return;
            },
        };

        // Unchanged version: the fire is dropped without notifying.
        let changed = self.cache.put(name, urls.clone(), version);
        if !changed {
            return;
        }
        let subscribers = self
            .watched
            .get(name)
            .map(|fns| fns.value().clone())
            .unwrap_or_default();
        for f in subscribers {
            f(&urls);
        }
    }

    async fn drive_session_events(&self) {
        let mut reconnected = false;
        {
            let mut rx = self.session_rx.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match rx.try_recv() {
                    Ok(SessionEvent::Reconnected) => reconnected = true,
                    Ok(SessionEvent::Expired) => {
                        warn!("coordination-store session expired");
                    },
                    Ok(SessionEvent::Connected) => {},
                    Err(broadcast::error::TryRecvError::Lagged(_)) => reconnected = true,
                    Err(_) => break,
                }
            }
        }
        if reconnected {
            self.restore().await;
        }
    }

    /// Re-applies credentials, remembered ephemerals, and active watches
    /// after the store session is re-established.
    async fn restore(&self) {
        info!("restoring naming state after session recovery");

        let credential = self
            .auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.credential.clone());
        if let Some(cred) = credential {
            if let Err(e) = self.store.add_auth("digest", &cred).await {
                warn!(code = e as i32, "auth restore failed: {e}");
            }
        }

        let leaves: Vec<(String, Vec<u8>)> = self
            .registered
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (leaf, value) in leaves {
            let parent = store::parent_of(&leaf).to_string();
            if self.ensure_dirs(&parent).await.is_err() {
                continue;
            }
            match self.store.create(&leaf, &value, true).await {
                Ok(()) | Err(StoreError::NodeExists) => {
                    debug!(path = %leaf, "ephemeral restored");
                },
                Err(e) => warn!(path = %leaf, code = e as i32, "ephemeral restore failed: {e}"),
            }
        }

        let names: Vec<String> = self.watched.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.refresh_watched(&name).await;
        }
    }

    /// Number of cached lookups; surfaced by the `stat` control command.
    pub fn cached_names(&self) -> usize {
        self.cache.len()
    }

    // ---- fetch internals -----------------------------------------------

    async fn fetch(&self, name: &str) -> Result<(Vec<String>, String), NamingError> {
        if name.contains('*') {
            self.fetch_wildcard(name).await
        } else {
            self.fetch_plain(name, false).await
        }
    }

    /// Plain fetch that re-arms the one-shot watches; used for watched
    /// names so exactly one logical watch registration stays outstanding.
    async fn fetch_armed(&self, name: &str) -> Result<(Vec<String>, String), NamingError> {
        self.fetch_plain(name, true).await
    }

    fn watcher_for(&self, name: &str) -> store::Watcher {
        let tx = self.fired_tx.clone();
        let name = name.to_string();
        Box::new(move |_event| {
            let _ = tx.send(name);
        })
    }

    /// Reads all instances under a literal name. The version string is
    /// `cversion|sum(child data versions)`, which changes on any child
    /// add/remove or value rewrite.
    async fn fetch_plain(&self, name: &str, arm: bool) -> Result<(Vec<String>, String), NamingError> {
        let children_watch = arm.then(|| self.watcher_for(name));
        let (children, stat) = match self.store.get_children(name, children_watch).await {
            Ok(ok) => ok,
            Err(StoreError::NoNode) => {
                // The name does not exist yet; an existence watch keeps
                // the always-armed invariant so creation wakes us up.
                if arm {
                    let _ = self.store.exists(name, Some(self.watcher_for(name))).await;
                }
                return Err(NamingError::UrlNotBound);
            },
            Err(_) => return Err(NamingError::RegisterFailed),
        };

        let mut urls = BTreeSet::new();
        let mut version_sum: i64 = 0;
        for child in children {
            let path = join_path(name, &child);
            let data_watch = arm.then(|| self.watcher_for(name));
            match self.store.get(&path, data_watch).await {
                Ok((data, cstat)) => {
                    version_sum += cstat.data_version;
                    self.collect_urls(&data, &mut urls);
                },
                // The instance vanished between the two reads.
                Err(StoreError::NoNode) => continue,
                Err(e) => {
                    debug!(%path, "instance read failed: {e}");
                },
            }
        }
        let version = format!("{}|{}", stat.cversion, version_sum);
        Ok((urls.into_iter().collect(), version))
    }

    /// Segment-by-segment BFS for wildcard names; `*` never crosses a
    /// `/` boundary.
    async fn fetch_wildcard(&self, name: &str) -> Result<(Vec<String>, String), NamingError> {
        let segments: Vec<&str> = name.split('/').skip(1).collect();
        let mut frontier: Vec<String> = vec![String::new()];

        for seg in segments {
            let mut next = Vec::new();
            if seg.contains('*') {
                for prefix in &frontier {
                    let parent = if prefix.is_empty() { "/" } else { prefix.as_str() };
                    let Ok((children, _)) = self.store.get_children(parent, None).await else {
                        continue;
                    };
                    for child in children {
                        if glob_match(seg, &child) {
                            next.push(join_path(parent, &child));
                        }
                    }
                }
            } else {
                for prefix in &frontier {
                    let parent = if prefix.is_empty() { "/" } else { prefix.as_str() };
                    next.push(join_path(parent, seg));
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        let mut urls = BTreeSet::new();
        let mut versions = Vec::new();
        for node in frontier {
            match self.fetch_plain(&node, false).await {
                Ok((node_urls, version)) => {
                    urls.extend(node_urls);
                    versions.push(format!("{node}={version}"));
                },
                Err(NamingError::UrlNotBound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((urls.into_iter().collect(), versions.join(";")))
    }

    fn collect_urls(&self, data: &[u8], out: &mut BTreeSet<String>) {
        let Ok(text) = std::str::from_utf8(data) else {
            return;
        };
        match split_url_list(text) {
            Ok(urls) => out.extend(urls),
            Err(_) => debug!("undecodable url list skipped"),
        }
    }
}

/// `*` matches zero or more characters, never crossing segment
/// boundaries (the caller matches one segment at a time).
pub(crate) fn glob_match(pattern: &str, s: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = s.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = pi;
            mark = ti;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
