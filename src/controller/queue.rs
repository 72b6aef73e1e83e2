//! Deduplicating work queue with per-key exclusivity and retry bookkeeping
//!
//! A key is either waiting, in flight, or both. Adding a key that is already
//! waiting is a no-op; adding a key that is in flight marks it dirty and it
//! becomes available again once the worker holding it calls [`WorkQueue::done`].
//! No two workers ever hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::store::ObjectKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    retries: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Pending reconciliations of one controller
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a key for reconciliation; returns false if it coalesced with a pending item
    pub fn add(&self, key: ObjectKey) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return false;
        }

        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for the next key not held by another worker
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key obtained from [`WorkQueue::get`]
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-add a key after a failure and count the retry
    pub fn retry(&self, key: ObjectKey) -> u32 {
        let count = {
            let mut state = self.state.lock();
            let count = state.retries.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.add(key);
        count
    }

    /// Retries recorded for a key since it was last forgotten
    pub fn retries(&self, key: &ObjectKey) -> u32 {
        self.state.lock().retries.get(key).copied().unwrap_or(0)
    }

    /// Clear the retry counter of a key
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().retries.remove(key);
    }

    /// Stop handing out keys; waiting and future `get` calls return `None`
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    #[test]
    fn duplicate_adds_coalesce() {
        let queue = WorkQueue::new();
        assert!(queue.add(key("a")));
        assert!(!queue.add(key("a")));
        assert!(queue.add(key("b")));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add(key("a"));

        let first = queue.get().await.unwrap();
        assert_eq!(first, key("a"));

        // Re-added while in flight: deferred, not queued
        assert!(!queue.add(key("a")));
        assert!(queue.is_empty());

        let mut second = task::spawn(queue.get());
        assert_pending!(second.poll());

        queue.done(&first);
        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Some(key("a")));
    }

    #[tokio::test]
    async fn done_without_dirty_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let k = queue.get().await.unwrap();
        queue.done(&k);
        assert!(queue.is_empty());
    }

    #[test]
    fn retry_counts_until_forgotten() {
        let queue = WorkQueue::new();
        assert_eq!(queue.retry(key("a")), 1);
        assert_eq!(queue.retry(key("a")), 2);
        assert_eq!(queue.retries(&key("a")), 2);

        queue.forget(&key("a"));
        assert_eq!(queue.retries(&key("a")), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let queue = WorkQueue::new();

        let mut waiting = task::spawn(queue.get());
        assert_pending!(waiting.poll());

        queue.shut_down();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), None);
        assert!(!queue.add(key("a")));
    }

    #[tokio::test]
    async fn shutdown_discards_pending_items() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.shut_down();
        assert_eq!(queue.get().await, None);
    }
}
