//! Ingressor work queue: deduplicating, per-item exclusive, rate-limited.
//!
//! Every item is in one of three states: absent, pending (dirty) or
//! in-flight (processing). An item that is re-added while in-flight stays
//! dirty and becomes ready again on `done`, so no update is lost and no two
//! workers ever hold the same item.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Bound for anything that can be queued.
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    /// Delayed adds and their deadline; only the earliest one is kept.
    waiting: FxHashMap<T, Instant>,
    enqueued_at: FxHashMap<T, Instant>,
    started_at: FxHashMap<T, Instant>,
    shutting_down: bool,
}

struct Shared<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    ready: Notify,
    closed: watch::Sender<bool>,
    limiter: Box<dyn RateLimiter<T>>,
}

/// Cheaply clonable handle; all clones share one queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: &'static str, limiter: impl RateLimiter<T> + 'static) -> Self {
        let (closed, _) = watch::channel(false);
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            enqueued_at: FxHashMap::default(),
            started_at: FxHashMap::default(),
            shutting_down: false,
        };
        Self {
            shared: Arc::new(Shared { name, state: Mutex::new(state), ready: Notify::new(), closed, limiter: Box::new(limiter) }),
        }
    }

    /// Queue using `default_controller_rate_limiter`.
    pub fn with_default_limiter(name: &'static str) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // no critical section can panic half-way, so a poisoned state is still consistent
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `item` pending. Collapses with an existing pending entry and
    /// defers behind an in-flight one.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down {
            trace!(queue = self.shared.name, ?item, "add after shutdown ignored");
            return;
        }
        self.add_locked(&mut st, item);
    }

    fn add_locked(&self, st: &mut State<T>, item: T) {
        if st.dirty.contains(&item) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.shared.name);
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            return;
        }
        self.push_ready(st, item);
    }

    fn push_ready(&self, st: &mut State<T>, item: T) {
        st.enqueued_at.insert(item.clone(), Instant::now());
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
        self.shared.ready.notify_one();
    }

    /// Wait for the next ready item and mark it in-flight. Returns `None`
    /// once the queue is shut down, even if items are still pending.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            // register before inspecting state so a concurrent add cannot slip by
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
                    if let Some(at) = st.enqueued_at.remove(&item) {
                        histogram!("workqueue_queue_latency_ms", at.elapsed().as_secs_f64() * 1000.0, "name" => self.shared.name);
                    }
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    st.started_at.insert(item.clone(), Instant::now());
                    if !st.queue.is_empty() {
                        self.shared.ready.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Finish processing `item`. If it was added again meanwhile it is
    /// immediately ready for another worker.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if let Some(at) = st.started_at.remove(item) {
            histogram!("workqueue_work_duration_ms", at.elapsed().as_secs_f64() * 1000.0, "name" => self.shared.name);
        }
        if st.dirty.contains(item) && !st.shutting_down {
            self.push_ready(&mut st, item.clone());
        }
    }

    /// Add `item` once `delay` has passed. While a delayed add is pending,
    /// only an earlier deadline replaces it.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            if matches!(st.waiting.get(&item), Some(existing) if *existing <= deadline) {
                return;
            }
            st.waiting.insert(item.clone(), deadline);
        }
        debug!(queue = self.shared.name, ?item, delay_ms = delay.as_millis() as u64, "delayed add scheduled");
        let queue = self.clone();
        let mut closed = self.shared.closed.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = closed.wait_for(|c| *c) => return,
            }
            let mut st = queue.lock();
            if st.waiting.get(&item) != Some(&deadline) {
                // superseded by an earlier deadline
                return;
            }
            st.waiting.remove(&item);
            if !st.shutting_down {
                queue.add_locked(&mut st, item);
            }
        });
    }

    /// Re-add `item` after the limiter's backoff for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "name" => self.shared.name);
        self.add_after(item, delay);
    }

    pub fn num_requeues(&self, item: &T) -> u32 { self.shared.limiter.num_requeues(item) }

    /// Reset the backoff state of `item`.
    pub fn forget(&self, item: &T) { self.shared.limiter.forget(item) }

    /// Stop handing out items: waiting `get`s return `None`, later adds and
    /// pending delayed adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.waiting.clear();
        }
        self.shared.closed.send_replace(true);
        self.shared.ready.notify_waiters();
        debug!(queue = self.shared.name, "work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn name(&self) -> &'static str { self.shared.name }
}
