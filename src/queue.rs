use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::debug;
use tokio::sync::Semaphore;

/// Base delay for the per-key exponential back-off.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for the per-key exponential back-off.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// A named, rate-limited, deduplicating FIFO of string keys.
///
/// The queue guarantees that a key is never handed to more than one consumer
/// at a time: adds for a key that is currently in-flight are coalesced and
/// re-delivered once the consumer calls [`done`](RateLimitingQueue::done).
/// [`add_rate_limited`](RateLimitingQueue::add_rate_limited) schedules a
/// re-add after an exponentially increasing per-key delay which is reset by
/// [`forget`](RateLimitingQueue::forget).
///
/// Keys are opaque; the queue neither parses nor validates them.
pub(crate) struct RateLimitingQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    /// One permit per entry in `QueueState::queue`. Closed on shutdown to
    /// wake all pending `get` calls.
    items: Semaphore,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys that need processing: queued, or in-flight with a pending re-add.
    dirty: HashSet<String>,
    /// Keys currently handed out to a consumer.
    processing: HashSet<String>,
    /// Consecutive rate-limited re-adds per key.
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl RateLimitingQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            items: Semaphore::new(0),
        })
    }

    /// Appends `key` unless it is already pending. If the key is in-flight it
    /// is marked dirty and re-delivered after the current processing round
    /// completes.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.items.add_permits(1);
    }

    /// Schedules `add(key)` after the key's current back-off delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("queue state poisoned");
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };
        debug!("{} queue: requeuing {:?} in {:?}", self.name, key, delay);
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Blocks until a key is available, returning `None` once the queue has
    /// been shut down. The returned key is in-flight until `done` is called
    /// for it.
    pub async fn get(&self) -> Option<String> {
        match self.items.acquire().await {
            Ok(permit) => {
                permit.forget();
                let mut state = self.state.lock().expect("queue state poisoned");
                // Permits are only added after a push, so the queue is never
                // empty here.
                let key = state.queue.pop_front()?;
                state.dirty.remove(&key);
                state.processing.insert(key.clone());
                Some(key)
            }
            // The semaphore is closed by shut_down.
            Err(_) => None,
        }
    }

    /// Marks `key` as no longer in-flight, re-enqueuing it if adds arrived
    /// while it was being processed.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue state poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.items.add_permits(1);
        }
    }

    /// Resets the key's back-off history.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("queue state poisoned");
        state.failures.remove(key);
    }

    /// Wakes all waiters; subsequent `get` calls return `None` and `add`
    /// becomes a no-op.
    pub fn shut_down(&self) {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        drop(state);
        debug!("{} queue shutting down", self.name);
        self.items.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().expect("queue state poisoned").shutting_down
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue state poisoned").queue.len()
    }
}

/// Exponential back-off starting at [`BASE_DELAY`], capped at [`MAX_DELAY`].
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(60);
    let delay = BASE_DELAY.as_secs_f64() * 2f64.powi(exp as i32);
    Duration::from_secs_f64(delay.min(MAX_DELAY.as_secs_f64()))
}
