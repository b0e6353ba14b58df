//! Delaying, per-key-deduplicating work queue for the Skymeter pipeline.
#![forbid(unsafe_code)]
//!
//! [`WorkQueue`] hands out keys to a pool of workers with three guarantees:
//!
//! - **Per-key uniqueness**: a key admitted multiple times before a worker
//!   picks it up is handed out once. A key re-admitted while a worker holds
//!   it is marked dirty and becomes visible again only after
//!   [`WorkQueue::done`], so a given key is never owned by two workers at the
//!   same time.
//! - **Delayed visibility**: [`WorkQueue::add_after`] keeps the key in an
//!   explicit time-ordered set and makes it visible once its deadline
//!   passes. This is the sole cadence mechanism of the pipeline: workers
//!   re-admit each key with a fixed delay after every cycle.
//! - **Cooperative shutdown**: [`WorkQueue::shut_down`] cancels delayed
//!   entries, wakes every blocked [`WorkQueue::get`] with `None`, and turns
//!   further admissions into no-ops. In-flight keys finish their current
//!   cycle.
//!
//! # Example
//!
//! ```rust
//! use skymeter_queue::WorkQueue;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue: WorkQueue<String> = WorkQueue::new("clusters");
//! queue.add("c1".to_string());
//! queue.add("c1".to_string()); // collapses with the pending entry
//!
//! let key = queue.get().await.unwrap();
//! queue.done(&key);
//! queue.add_after(key, Duration::from_millis(10));
//!
//! queue.shut_down();
//! assert!(queue.get().await.is_none());
//! # }
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::debug;

/// A delayed entry, ordered by its visibility deadline.
struct DelayedEntry<K> {
    at: Instant,
    key: K,
}

impl<K> PartialEq for DelayedEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl<K> Eq for DelayedEntry<K> {}

impl<K> PartialOrd for DelayedEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for DelayedEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at)
    }
}

struct Inner<K> {
    /// Keys visible to `get`, in admission order.
    ready: VecDeque<K>,
    /// Keys currently in `ready` or `delayed`.
    queued: HashSet<K>,
    /// Keys handed to a worker and not yet acknowledged with `done`.
    processing: HashSet<K>,
    /// Keys re-admitted while processing; re-queued by `done`.
    dirty: HashSet<K>,
    /// Time-ordered delayed admissions (min-heap on deadline).
    delayed: BinaryHeap<Reverse<DelayedEntry<K>>>,
    shutting_down: bool,
}

/// Key-unique delaying work queue.
///
/// Shared between the intake task and workers behind an `Arc`.
pub struct WorkQueue<K> {
    name: &'static str,
    inner: Mutex<Inner<K>>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates a new empty queue. The name is used only for logging.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            name,
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                delayed: BinaryHeap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Admits `key` with immediate visibility.
    ///
    /// Collapses with any pending entry for the same key. If the key is
    /// currently held by a worker it is marked dirty and re-admitted when
    /// that worker calls [`WorkQueue::done`]. No-op once shutting down.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        if !inner.queued.insert(key.clone()) {
            return;
        }
        inner.ready.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Admits `key`, becoming visible after `delay`.
    ///
    /// Same deduplication rules as [`WorkQueue::add`]; a zero delay is an
    /// immediate admission.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        if !inner.queued.insert(key.clone()) {
            return;
        }
        inner.delayed.push(Reverse(DelayedEntry {
            at: Instant::now() + delay,
            key,
        }));
        drop(inner);
        // Wake a waiter so it recomputes the earliest deadline.
        self.notify.notify_one();
    }

    /// Waits until a key becomes visible and hands it out, or returns `None`
    /// once the queue is shut down.
    ///
    /// The returned key is considered in flight until acknowledged with
    /// [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let deadline = {
                let mut inner = self.inner.lock();
                Self::promote_due(&mut inner);
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.ready.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.ready.is_empty() {
                        // Cascade the wakeup to another waiter.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                inner.delayed.peek().map(|Reverse(entry)| entry.at)
            };

            let notified = self.notify.notified();
            if let Some(at) = deadline {
                tokio::select! {
                    () = notified => {}
                    () = tokio::time::sleep_until(at) => {}
                    _ = shutdown_rx.changed() => {}
                }
            } else {
                tokio::select! {
                    () = notified => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    /// Acknowledges that processing of `key` finished.
    ///
    /// If the key was re-admitted while in flight it becomes visible again.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.remove(key) && !inner.shutting_down {
            inner.queued.insert(key.clone());
            inner.ready.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Requests shutdown: discards pending and delayed entries, wakes every
    /// blocked [`WorkQueue::get`], and ignores further admissions. Keys
    /// already handed out finish their current cycle.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            inner.ready.clear();
            inner.queued.clear();
            inner.dirty.clear();
            inner.delayed.clear();
        }
        debug!(queue = self.name, "queue shutting down");
        self.shutdown_tx.send_replace(true);
        self.notify.notify_waiters();
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Number of admitted keys not yet handed out (ready plus delayed).
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    /// Returns `true` if no admitted key is waiting to be handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves delayed entries whose deadline has passed into the ready set.
    fn promote_due(inner: &mut Inner<K>) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = inner.delayed.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = inner.delayed.pop() else {
                break;
            };
            if inner.processing.contains(&entry.key) {
                inner.queued.remove(&entry.key);
                inner.dirty.insert(entry.key);
            } else {
                inner.ready.push_back(entry.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn add_then_get() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.add("k1".to_string());

        assert_eq!(queue.get().await, Some("k1".to_string()));
    }

    #[tokio::test]
    async fn get_parks_until_a_key_is_admitted() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let queue: WorkQueue<String> = WorkQueue::new("test");
        let mut get = task::spawn(queue.get());
        assert_pending!(get.poll());

        queue.add("k1".to_string());
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), Some("k1".to_string()));
    }

    #[tokio::test]
    async fn duplicate_pending_keys_collapse() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.add("k1".to_string());
        queue.add("k1".to_string());
        queue.add("k1".to_string());
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_visibility() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.add_after("k1".to_string(), Duration::from_secs(5));

        // Not visible before the deadline.
        let early = tokio::time::timeout(Duration::from_secs(1), queue.get()).await;
        assert!(early.is_err());

        // Visible after it (paused clock auto-advances on sleep).
        let key = tokio::time::timeout(Duration::from_secs(10), queue.get())
            .await
            .unwrap();
        assert_eq!(key, Some("k1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_zero_is_immediate() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.add_after("k1".to_string(), Duration::ZERO);
        assert_eq!(queue.get().await, Some("k1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_entries_come_out_in_deadline_order() {
        let queue: WorkQueue<&'static str> = WorkQueue::new("test");
        queue.add_after("late", Duration::from_secs(10));
        queue.add_after("early", Duration::from_secs(1));

        assert_eq!(queue.get().await, Some("early"));
        queue.done(&"early");
        assert_eq!(queue.get().await, Some("late"));
    }

    #[tokio::test]
    async fn in_flight_key_is_not_handed_out_twice() {
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new("test"));
        queue.add("k1".to_string());

        let key = queue.get().await.unwrap();

        // Re-admitting while in flight marks it dirty, not visible.
        queue.add("k1".to_string());
        let second = tokio::time::timeout(SHORT, queue.get()).await;
        assert!(second.is_err());

        // After done, the dirty key is visible again.
        queue.done(&key);
        let key = tokio::time::timeout(SHORT, queue.get()).await.unwrap();
        assert_eq!(key, Some("k1".to_string()));
    }

    #[tokio::test]
    async fn done_without_dirty_does_not_requeue() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.add("k1".to_string());

        let key = queue.get().await.unwrap();
        queue.done(&key);

        let next = tokio::time::timeout(SHORT, queue.get()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiting_getters() {
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new("test"));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        // Let the waiter block.
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_delayed_entries_and_ignores_adds() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.add_after("k1".to_string(), Duration::from_secs(60));
        queue.shut_down();

        assert!(queue.shutting_down());
        assert!(queue.is_empty());

        queue.add("k2".to_string());
        queue.add_after("k3".to_string(), Duration::from_millis(1));
        assert!(queue.is_empty());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn get_after_shutdown_returns_none_immediately() {
        let queue: WorkQueue<String> = WorkQueue::new("test");
        queue.shut_down();
        assert!(queue.get().await.is_none());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn many_workers_never_share_a_key() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new("test"));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let overlaps = Arc::new(Mutex::new(0u32));

        // Few keys, many workers, each cycle re-admits its key.
        for key in 0..3u32 {
            queue.add(key);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    if !in_flight.lock().insert(key) {
                        *overlaps.lock() += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.lock().remove(&key);
                    queue.done(&key);
                    queue.add_after(key, Duration::from_millis(1));
                }
            }));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        queue.shut_down();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*overlaps.lock(), 0);
    }
}
