//! The assignment lock guarding the shared task graph.
//!
//! The scheduling loop and the modification synchronizer both mutate the
//! graph. The loop only ever probes the lock (`try_acquire`) and holds it for
//! short synchronous sections; the synchronizer holds it for a whole edit
//! cycle through an [`EditGuard`], whose drop wakes the loop.

use crate::core::dag::TaskGraph;
use std::ops::{Deref, DerefMut};
use tokio::sync::{Mutex, MutexGuard, Notify};

/// Mutual exclusion over the task graph plus a release notification.
#[derive(Debug)]
pub struct AssignmentLock {
    graph: Mutex<TaskGraph>,
    released: Notify,
}

impl AssignmentLock {
    pub fn new(graph: TaskGraph) -> Self {
        Self {
            graph: Mutex::new(graph),
            released: Notify::new(),
        }
    }

    /// Wait for the lock.
    pub async fn acquire(&self) -> MutexGuard<'_, TaskGraph> {
        self.graph.lock().await
    }

    /// Take the lock if nobody holds it.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, TaskGraph>> {
        self.graph.try_lock().ok()
    }

    /// Wait for the lock for an edit cycle. Dropping the guard notifies
    /// `released()` waiters.
    pub async fn acquire_for_edit(&self) -> EditGuard<'_> {
        EditGuard {
            guard: self.graph.lock().await,
            released: &self.released,
        }
    }

    /// Resolves after the next edit guard is dropped.
    ///
    /// A release that happened while nobody was waiting is remembered, so a
    /// caller that failed `try_acquire` and then awaits this does not miss it.
    pub async fn released(&self) {
        self.released.notified().await
    }
}

/// Lock guard held for the duration of an edit cycle.
pub struct EditGuard<'a> {
    guard: MutexGuard<'a, TaskGraph>,
    released: &'a Notify,
}

impl Deref for EditGuard<'_> {
    type Target = TaskGraph;

    fn deref(&self) -> &TaskGraph {
        &self.guard
    }
}

impl DerefMut for EditGuard<'_> {
    fn deref_mut(&mut self) -> &mut TaskGraph {
        &mut self.guard
    }
}

impl Drop for EditGuard<'_> {
    fn drop(&mut self) {
        // notify_one stores a permit when no waiter is registered yet.
        self.released.notify_one();
    }
}
