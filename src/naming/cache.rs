// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Lookup cache for resolved URL sets.
//!
//! An entry younger than `refresh` is served as-is; between `refresh` and
//! `invalid` it is refreshed but can still stand in if the store is
//! unreachable; past `invalid` it is discarded outright. Watch fires
//! replace entries proactively, so a reader inside a watch callback sees
//! the new set.

use std::time::Duration;

use dashmap::DashMap;

use crate::transport::now_ms;

#[derive(Debug, Clone)]
struct CacheEntry {
    urls: Vec<String>,
    version: String,
    fetched_ms: u64,
}

#[derive(Debug)]
pub(crate) enum CacheLookup {
    Fresh(Vec<String>),
    /// Refresh due, but usable as a fallback.
    Stale(Vec<String>),
    Miss,
}

pub(crate) struct UrlCache {
    entries: DashMap<String, CacheEntry>,
    refresh: Duration,
    invalid: Duration,
}

impl UrlCache {
    pub(crate) fn new(refresh: Duration, invalid: Duration) -> Self {
        Self { entries: DashMap::new(), refresh, invalid }
    }

    pub(crate) fn get(&self, name: &str) -> CacheLookup {
        let Some(entry) = self.entries.get(name) else {
            return CacheLookup::Miss;
        };
        let age = now_ms().saturating_sub(entry.fetched_ms);
        if age < self.refresh.as_millis() as u64 {
            CacheLookup::Fresh(entry.urls.clone())
        } else if age < self.invalid.as_millis() as u64 {
            CacheLookup::Stale(entry.urls.clone())
        } else {
            drop(entry);
            self.entries.remove(name);
            CacheLookup::Miss
        }
    }

    /// Replaces the entry atomically; returns true if the version
    /// actually changed.
    pub(crate) fn put(&self, name: &str, urls: Vec<String>, version: String) -> bool {
        let changed = self
            .entries
            .get(name)
            .map(|e| e.version != version)
            .unwrap_or(true);
        self.entries.insert(name.to_string(), CacheEntry {
            urls,
            version,
            fetched_ms: now_ms(),
        });
        changed
    }

    pub(crate) fn version(&self, name: &str) -> Option<String> {
        self.entries.get(name).map(|e| e.version.clone())
    }

    pub(crate) fn remove(&self, name: &str) {
        self.entries.remove(name);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
