// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Cooperative task hosting for request handlers.
//!
//! The fabric runs on a current-thread runtime, so two tasks never
//! execute simultaneously and shared state needs no locking beyond what
//! the table itself uses. A spawned task does not run until its first
//! [`TaskSet::resume`]; inside a task, [`TaskSet::yield_now`] parks it
//! until the next resume. Handlers that only `.await` fabric APIs never
//! need to touch these directly; the engine hosts each handler in a
//! task so straight-line code can block on remote calls.
//!
//! Lifecycle per task: READY → RUNNING → (SUSPENDED → RUNNING)* → DEAD;
//! a task that returns from its future leaves the table on its own.

use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, Ordering},
};

use dashmap::DashMap;
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::debug;

pub type TaskId = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    #[error("no such task")]
    NoSuchTask,
    #[error("not inside a task")]
    NotInTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Suspended = 2,
}

struct TaskEntry {
    gate: Arc<Notify>,
    state: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

tokio::task_local! {
    static CURRENT_TASK: TaskId;
}

/// Returns the id of the task the caller is running inside, if any.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.try_with(|id| *id).ok()
}

/// The scheduler: a table of cooperatively-driven tasks.
#[derive(Default)]
pub struct TaskSet {
    tasks: Arc<DashMap<TaskId, TaskEntry>>,
    next_id: AtomicU64,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task in READY state; it does not run until the first
    /// [`resume`](Self::resume).
    pub fn spawn<F>(&self, fut: F) -> TaskId
    where F: Future<Output = ()> + Send + 'static {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let gate = Arc::new(Notify::new());
        let state = Arc::new(AtomicU8::new(TaskState::Ready as u8));

        let tasks = Arc::clone(&self.tasks);
        let task_gate = Arc::clone(&gate);
        let task_state = Arc::clone(&state);
        let join = tokio::spawn(CURRENT_TASK.scope(id, async move {
            task_gate.notified().await;
            task_state.store(TaskState::Running as u8, Ordering::Relaxed);
            fut.await;
            tasks.remove(&id);
        }));

        self.tasks.insert(id, TaskEntry { gate, state, join });
        id
    }

    /// Spawns and immediately resumes. The common path for hosting a
    /// request handler.
    pub fn spawn_running<F>(&self, fut: F) -> TaskId
    where F: Future<Output = ()> + Send + 'static {
        let id = self.spawn(fut);
        // The permit is stored, so the race with first poll is benign.
        let _ = self.resume(id);
        id
    }

    /// Releases a READY or SUSPENDED task. Calling it for a task that is
    /// between suspension points stores the permit for its next yield.
    pub fn resume(&self, id: TaskId) -> Result<(), SchedError> {
        let entry = self.tasks.get(&id).ok_or(SchedError::NoSuchTask)?;
        entry.state.store(TaskState::Running as u8, Ordering::Relaxed);
        entry.gate.notify_one();
        Ok(())
    }

    /// Parks the calling task until the next resume. Must be called from
    /// inside a task belonging to this set.
    pub async fn yield_now(&self) -> Result<(), SchedError> {
        let id = current_task_id().ok_or(SchedError::NotInTask)?;
        let (gate, state) = {
            let entry = self.tasks.get(&id).ok_or(SchedError::NoSuchTask)?;
            (Arc::clone(&entry.gate), Arc::clone(&entry.state))
        };
        state.store(TaskState::Suspended as u8, Ordering::Relaxed);
        gate.notified().await;
        state.store(TaskState::Running as u8, Ordering::Relaxed);
        Ok(())
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|e| match e.state.load(Ordering::Relaxed) {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            _ => TaskState::Suspended,
        })
    }

    /// Number of live (not DEAD) tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Destroys every task in any state.
    pub fn close(&self) {
        let ids: Vec<TaskId> = self.tasks.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.tasks.remove(&id) {
                entry.join.abort();
            }
        }
        debug!("task set closed");
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.close();
    }
}
