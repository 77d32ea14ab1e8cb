// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Client-side routing: binds one service name to its live endpoint set
//! and selects a handle per call.
//!
//! The router subscribes to its name through the naming layer. A watch
//! fire only records the new URL set; the actual reconciliation (close
//! vanished endpoints, connect appeared ones, keep the live list stable
//! and deduplicated) happens when the node's update tick drains the
//! recorded set through [`Router::update`], so endpoint churn stays an
//! ordered step of the single-threaded loop instead of a detached task.
//! Selection policies never block; with zero live handles every policy
//! reports `NoValidHandle`.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{
    codec::CodecKind,
    error::RouterError,
    naming::Naming,
    transport::{Transport, handle::Handle},
};

/// Pluggable selection over the live handle list.
pub enum RoutePolicy {
    /// `handles[counter++ % n]`.
    RoundRobin,
    /// `handles[key % n]`; the caller supplies the key (a hash works the
    /// same way).
    Mod,
    /// Caller-supplied selection.
    User(Box<dyn Fn(u64, &[Handle]) -> Option<Handle> + Send + Sync>),
}

type AddressChangedFn = Box<dyn Fn(&[Handle]) + Send + Sync>;

pub struct Router {
    name: String,
    policy: RoutePolicy,
    codec: CodecKind,
    transport: Arc<Transport>,
    /// Live endpoints: (url, handle), sorted by url, deduplicated.
    endpoints: Mutex<Vec<(String, Handle)>>,
    /// Latest URL set reported by the naming watch, awaiting the next
    /// update tick. Sets are absolute, so newer fires overwrite older
    /// ones.
    pending: Mutex<Option<Vec<String>>>,
    counter: AtomicU64,
    on_address_changed: Mutex<Option<AddressChangedFn>>,
}

impl Router {
    pub fn new(
        name: impl Into<String>,
        policy: RoutePolicy,
        codec: CodecKind,
        transport: Arc<Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            policy,
            codec,
            transport,
            endpoints: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            counter: AtomicU64::new(0),
            on_address_changed: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoked with the new handle list after every endpoint update; the
    /// engine uses it to hook its dispatcher onto fresh handles.
    pub fn set_on_address_changed(&self, f: AddressChangedFn) {
        *self
            .on_address_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(f);
    }

    /// Seeds the endpoint set and subscribes to the name. Call once.
    pub async fn init(self: &Arc<Self>, naming: &Arc<Naming>) -> Result<(), RouterError> {
        if self.name.is_empty() {
            return Err(RouterError::InvalidParam);
        }
        let weak = Arc::downgrade(self);
        naming
            .watch_name(
                &self.name,
                Arc::new(move |urls: &[String]| {
                    if let Some(router) = weak.upgrade() {
                        router.enqueue_urls(urls.to_vec());
                    }
                }),
            )
            .await
            .map_err(|_| RouterError::InvalidParam)?;

        let urls = naming
            .get_urls_by_name(&self.name)
            .await
            .unwrap_or_default();
        self.apply_urls(urls).await;
        Ok(())
    }

    /// Records the newest URL set; applied by the next [`Self::update`].
    fn enqueue_urls(&self, urls: Vec<String>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(urls);
    }

    /// Drains the recorded URL set, if any. Runs as the router step of
    /// the node's update tick; returns 1 when a reconciliation happened.
    pub async fn update(&self) -> usize {
        let queued = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match queued {
            Some(urls) => {
                self.apply_urls(urls).await;
                1
            },
            None => 0,
        }
    }

    /// Reconciles the live endpoint list against `urls`.
    pub async fn apply_urls(&self, urls: Vec<String>) {
        let mut target: Vec<String> = urls;
        target.sort();
        target.dedup();

        let (to_close, kept): (Vec<(String, Handle)>, Vec<(String, Handle)>) = {
            let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints
                .iter()
                .cloned()
                .partition(|(url, _)| !target.contains(url))
        };
        for (url, h) in &to_close {
            debug!(name = %self.name, %url, handle = h, "endpoint removed");
            self.transport.close(*h);
        }

        let mut next = kept;
        for url in target {
            if next.iter().any(|(u, _)| *u == url) {
                continue;
            }
            match self.transport.connect(&url, self.codec).await {
                Ok(h) => {
                    debug!(name = %self.name, %url, handle = h, "endpoint added");
                    next.push((url, h));
                },
                Err(e) => {
                    warn!(name = %self.name, %url, code = e as i32, "endpoint connect failed: {e}");
                },
            }
        }
        next.sort_by(|a, b| a.0.cmp(&b.0));

        let handles: Vec<Handle> = next.iter().map(|(_, h)| *h).collect();
        *self.endpoints.lock().unwrap_or_else(|e| e.into_inner()) = next;

        if let Some(f) = self
            .on_address_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            f(&handles);
        }
    }

    /// Drops a handle from the live list without closing it; used when
    /// the transport reports it dead.
    pub fn forget_handle(&self, h: Handle) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.retain(|(_, eh)| *eh != h);
    }

    /// Selects one live handle for `key` per the configured policy.
    pub fn get_route(&self, key: u64) -> Result<Handle, RouterError> {
        let handles: Vec<Handle> = {
            let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.iter().map(|(_, h)| *h).collect()
        };
        if handles.is_empty() {
            return Err(RouterError::NoValidHandle);
        }
        match &self.policy {
            RoutePolicy::RoundRobin => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(handles[(n % handles.len() as u64) as usize])
            },
            RoutePolicy::Mod => Ok(handles[(key % handles.len() as u64) as usize]),
            RoutePolicy::User(f) => f(key, &handles).ok_or(RouterError::NoValidHandle),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
