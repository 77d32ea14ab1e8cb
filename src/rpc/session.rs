// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Outstanding-request bookkeeping.
//!
//! A session is one outbound request awaiting its reply. The table keeps
//! two views: id → session for correlation, and an ordered deadline index
//! for the timeout sweep. Ids are monotonic, so under a fixed timeout the
//! deadline walk sees old sessions first and can stop at the first
//! unexpired entry.

use std::{
    collections::BTreeMap,
    sync::{Mutex, atomic::{AtomicU64, Ordering}},
};

use bytes::Bytes;
use dashmap::DashMap;

use crate::{codec::RpcException, transport::handle::Handle};

/// Fired exactly once per session: on reply, remote exception, timeout,
/// or engine shutdown.
pub type ResponseCb = Box<dyn FnOnce(Result<Bytes, RpcException>) + Send + Sync>;

pub(crate) struct Session {
    pub(crate) handle: Handle,
    pub(crate) cb: ResponseCb,
    pub(crate) deadline_ms: u64,
}

#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: DashMap<u64, Session>,
    deadlines: Mutex<BTreeMap<(u64, u64), ()>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ids start at 1; 0 stays free as the ONEWAY "no session" marker.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn insert(&self, id: u64, session: Session) {
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((session.deadline_ms, id), ());
        self.sessions.insert(id, session);
    }

    /// Removes and returns the session, dropping its deadline entry.
    pub(crate) fn take(&self, id: u64) -> Option<Session> {
        let (_, session) = self.sessions.remove(&id)?;
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(session.deadline_ms, id));
        Some(session)
    }

    /// Sessions whose deadline is at or before `now_ms`, oldest first.
    pub(crate) fn expire(&self, now_ms: u64) -> Vec<(u64, Session)> {
        let expired_ids: Vec<u64> = {
            let mut deadlines = self.deadlines.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids = Vec::new();
            while let Some((&(deadline, id), ())) = deadlines.iter().next() {
                if deadline > now_ms {
                    break;
                }
                deadlines.remove(&(deadline, id));
                ids.push(id);
            }
            ids
        };
        expired_ids
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, s)| (id, s)))
            .collect()
    }

    /// Empties the table; used on engine shutdown.
    pub(crate) fn drain(&self) -> Vec<(u64, Session)> {
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, s)| (id, s)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
