//! recertify work queue.
//!
//! A FIFO of keys with three guarantees:
//! - an item queued twice before it is picked up is processed once (`dirty` set);
//! - an item is never handed to two workers at once (`processing` set); adds that
//!   arrive while it is in flight are parked and requeued on [`WorkQueue::done`];
//! - requeues go through a [`RateLimiter`], so repeated failures back off.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::trace;

pub mod limiter;

pub use limiter::{default_controller_rate_limiter, ItemExponentialFailure, MaxOf, RateLimiter, TokenBucket};

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    limiter: Mutex<Box<dyn RateLimiter<K>>>,
    notify: Notify,
}

/// Handle to a shared queue; clones refer to the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Queue with the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(limiter),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue `item` unless it is already waiting. If it is in flight, it is
    /// queued again once the current holder calls [`done`](Self::done).
    pub fn add(&self, item: K) {
        let mut st = self.shared.state.lock().unwrap();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        metrics::counter!("workqueue_adds_total", 1u64, "name" => self.shared.name.clone());
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            trace!(queue = %self.shared.name, ?item, "in flight; parked until done");
            return;
        }
        st.queue.push_back(item);
        metrics::gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name.clone());
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next item and mark it in flight. Returns `None` once the
    /// queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            // registered before the state check so a notify_one racing with it is not lost
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock().unwrap();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    metrics::gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker taken by [`get`](Self::get).
    pub fn done(&self, item: &K) {
        let mut st = self.shared.state.lock().unwrap();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Enqueue after `delay`. Needs a tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(item);
        });
    }

    /// Enqueue after the delay the rate limiter assigns to `item`.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.shared.limiter.lock().unwrap().when(&item);
        metrics::counter!("workqueue_retries_total", 1u64, "name" => self.shared.name.clone());
        trace!(queue = %self.shared.name, ?item, ?delay, "requeue rate limited");
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &K) {
        self.shared.limiter.lock().unwrap().forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.shared.limiter.lock().unwrap().num_requeues(item)
    }

    /// Wake every waiting [`get`](Self::get) with `None` and refuse further adds.
    pub fn shut_down(&self) {
        self.shared.state.lock().unwrap().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().unwrap().shutting_down
    }

    /// Items waiting to be picked up (excludes in-flight ones).
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
