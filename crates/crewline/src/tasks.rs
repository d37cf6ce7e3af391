//! Lifecycle tracking for in-flight agent work.
//!
//! Two independent tables:
//!
//! - **chat tasks** — exclusive per session id: registering new work for a
//!   key first cancels any still-running work under the same key. Used for
//!   direct chat, where only the latest turn per (role, chat) matters.
//! - **background tasks** — parallel, keyed by task id: unlimited
//!   concurrently live entries, no cross-cancellation. Used for
//!   orchestration runs and delegated tasks.
//!
//! The tracker never inspects the work itself; it only aborts handles and
//! observes completion. Cancellation is cooperative: `JoinHandle::abort`
//! takes effect at the task's next await point.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::info;
use tokio::task::JoinHandle;

/// Tracks concurrently running units of work. Cheap to clone.
#[derive(Clone, Default)]
pub struct TaskTracker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    chat_tasks: DashMap<String, TrackedTask>,
    background_tasks: DashMap<String, TrackedTask>,
}

struct TrackedTask {
    /// Registration generation, used to guard against a superseded task's
    /// late cleanup removing its successor's entry.
    id: u64,
    handle: JoinHandle<()>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` as the only live chat task for `session_id`, cancelling
    /// any existing one for the same key first.
    pub fn spawn_chat<F>(&self, session_id: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some((_, old)) = self.inner.chat_tasks.remove(session_id)
            && !old.handle.is_finished()
        {
            info!("cancelling existing chat task for session {session_id}");
            old.handle.abort();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = CompletionGuard {
            inner: self.inner.clone(),
            table: Table::Chat,
            key: session_id.to_string(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await;
        });
        self.inner
            .chat_tasks
            .insert(session_id.to_string(), TrackedTask { id, handle });

        // The task may already have finished before we stored the handle,
        // in which case its guard fired against an absent entry.
        self.sweep_finished(Table::Chat, session_id, id);
    }

    /// Spawn `work` as an independent background task. Existing entries are
    /// never cancelled, under this or any other key.
    pub fn spawn_background<F>(&self, task_id: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = CompletionGuard {
            inner: self.inner.clone(),
            table: Table::Background,
            key: task_id.to_string(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await;
        });
        self.inner
            .background_tasks
            .insert(task_id.to_string(), TrackedTask { id, handle });

        self.sweep_finished(Table::Background, task_id, id);
    }

    fn sweep_finished(&self, table: Table, key: &str, id: u64) {
        let table = self.inner.table(table);
        let finished = table
            .get(key)
            .map(|t| t.id == id && t.handle.is_finished())
            .unwrap_or(false);
        if finished {
            table.remove_if(key, |_, t| t.id == id);
        }
    }

    pub fn chat_task_count(&self) -> usize {
        self.inner.chat_tasks.len()
    }

    pub fn background_task_count(&self) -> usize {
        self.inner.background_tasks.len()
    }

    pub fn has_chat_task(&self, session_id: &str) -> bool {
        self.inner.chat_tasks.contains_key(session_id)
    }
}

impl Inner {
    fn table(&self, table: Table) -> &DashMap<String, TrackedTask> {
        match table {
            Table::Chat => &self.chat_tasks,
            Table::Background => &self.background_tasks,
        }
    }
}

#[derive(Clone, Copy)]
enum Table {
    Chat,
    Background,
}

/// Removes a task's table entry on any terminal path — success, error or
/// abort — by running in the spawned future's drop.
struct CompletionGuard {
    inner: Arc<Inner>,
    table: Table,
    key: String,
    id: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        match self.table {
            // A superseding chat task may already occupy the key; only
            // remove our own registration.
            Table::Chat => {
                self.inner.chat_tasks.remove_if(&self.key, |_, t| t.id == self.id);
            }
            Table::Background => {
                self.inner.background_tasks.remove(&self.key);
            }
        }
    }
}
