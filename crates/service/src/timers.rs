//! Per-key debounce timers
//!
//! Each key has at most one pending timer. Scheduling a key that is already
//! pending moves its deadline and swaps in the newer callback, so the delay
//! and callback always come from the most recent submission.
//!
//! The table is owned by the service's event loop and never shared.

use debounce_core::{CallbackDescriptor, MAX_DELAY};
use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};

/// Outcome of [`TimerTable::debounce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// No timer was pending for the key
    New,
    /// A pending timer was cancelled and replaced
    Replaced,
}

/// Pending fire for one debounce key
#[derive(Debug)]
struct TimerEntry {
    queue_key: delay_queue::Key,
    fire_at: Instant,
    callback: CallbackDescriptor,
}

/// Debounce timers keyed by debounce key
#[derive(Debug)]
pub struct TimerTable {
    queue: DelayQueue<String>,
    entries: HashMap<String, TimerEntry>,
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            entries: HashMap::new(),
        }
    }

    /// Start a timer for `key`, or restart the pending one
    ///
    /// Delays longer than [`MAX_DELAY`] are shortened to it.
    pub fn debounce(&mut self, key: String, delay: Duration, callback: CallbackDescriptor) -> Scheduled {
        let now = Instant::now();
        let delay = delay.min(MAX_DELAY);
        let fire_at = now.checked_add(delay).unwrap_or(now);

        if let Some(entry) = self.entries.get_mut(&key) {
            self.queue.reset(&entry.queue_key, delay);
            entry.fire_at = fire_at;
            entry.callback = callback;
            return Scheduled::Replaced;
        }

        let queue_key = self.queue.insert(key.clone(), delay);
        self.entries.insert(
            key,
            TimerEntry {
                queue_key,
                fire_at,
                callback,
            },
        );
        Scheduled::New
    }

    /// Cancel the timer for `key` without firing it
    pub fn cancel(&mut self, key: &str) -> Option<CallbackDescriptor> {
        let entry = self.entries.remove(key)?;
        self.queue.remove(&entry.queue_key);
        Some(entry.callback)
    }

    /// Cancel every pending timer; returns how many were dropped
    pub fn reset(&mut self) -> usize {
        let cancelled = self.entries.len();
        self.queue.clear();
        self.entries.clear();
        cancelled
    }

    /// When `key` is due to fire, if pending
    pub fn pending(&self, key: &str) -> Option<Instant> {
        self.entries.get(key).map(|entry| entry.fire_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for the next timer to expire
    ///
    /// Returns `None` immediately when nothing is pending, so callers polling
    /// this inside `select!` should guard the branch with `!is_empty()`.
    pub async fn next_expired(&mut self) -> Option<(String, CallbackDescriptor)> {
        loop {
            let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
            let key = expired.into_inner();
            if let Some(entry) = self.entries.remove(&key) {
                return Some((key, entry.callback));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use serde_json::json;
    use std::collections::HashMap;

    fn callback(tag: &str) -> CallbackDescriptor {
        CallbackDescriptor::new("TestEvent", "publish").with_method_params(json!(tag))
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmission_replaces_pending_timer() {
        let mut timers = TimerTable::new();

        assert_eq!(
            timers.debounce("test".to_string(), Duration::from_secs(1), callback("first")),
            Scheduled::New
        );
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(
            timers.debounce("test".to_string(), Duration::from_secs(1), callback("second")),
            Scheduled::Replaced
        );
        assert_eq!(timers.len(), 1);

        let resubmitted_at = Instant::now();
        let (key, fired) = timers.next_expired().await.unwrap();

        assert_eq!(key, "test");
        assert_eq!(fired, callback("second"));
        assert!(resubmitted_at.elapsed() >= Duration::from_millis(999));
        assert!(timers.is_empty());
        assert!(timers.next_expired().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_fire_independently() {
        let mut timers = TimerTable::new();
        for key in ["a", "b", "c"] {
            timers.debounce(key.to_string(), Duration::from_secs(1), callback(key));
        }

        let mut fired = Vec::new();
        while let Some((key, cb)) = timers.next_expired().await {
            assert_eq!(cb, callback(&key));
            fired.push(key);
        }
        fired.sort();
        assert_eq!(fired, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_delay_fires_first() {
        let mut timers = TimerTable::new();
        timers.debounce("slow".to_string(), Duration::from_secs(2), callback("slow"));
        timers.debounce("fast".to_string(), Duration::from_millis(100), callback("fast"));

        assert_eq!(timers.next_expired().await.unwrap().0, "fast");
        assert!(timers.pending("slow").is_some());
        assert_eq!(timers.next_expired().await.unwrap().0, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_without_firing() {
        let mut timers = TimerTable::new();
        timers.debounce("a".to_string(), Duration::from_secs(1), callback("a"));
        timers.debounce("b".to_string(), Duration::from_secs(1), callback("b"));

        assert_eq!(timers.reset(), 2);
        assert!(timers.is_empty());
        assert!(timers.pending("a").is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(timers.next_expired().await.is_none());

        // Table stays usable after a reset
        timers.debounce("c".to_string(), Duration::from_millis(100), callback("c"));
        assert_eq!(timers.next_expired().await.unwrap().0, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single_key() {
        let mut timers = TimerTable::new();
        timers.debounce("a".to_string(), Duration::from_secs(1), callback("a"));
        timers.debounce("b".to_string(), Duration::from_secs(1), callback("b"));

        assert_eq!(timers.cancel("a"), Some(callback("a")));
        assert_eq!(timers.cancel("a"), None);

        assert_eq!(timers.next_expired().await.unwrap().0, "b");
        assert!(timers.next_expired().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_delay_is_capped() {
        let mut timers = TimerTable::new();
        let start = Instant::now();

        timers.debounce("forever".to_string(), Duration::MAX, callback("forever"));
        assert_eq!(timers.pending("forever"), Some(start + MAX_DELAY));

        timers.debounce("soon".to_string(), Duration::from_millis(10), callback("soon"));
        assert_eq!(timers.next_expired().await.unwrap().0, "soon");
        assert_eq!(timers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_bursts_fire_once_per_key_with_last_callback() {
        let mut rng = rand::thread_rng();
        let mut timers = TimerTable::new();
        let mut expected: HashMap<String, CallbackDescriptor> = HashMap::new();

        // Every delay outlasts the whole burst, so nothing is due mid-sequence
        for i in 0..200 {
            let key = format!("key-{}", rng.gen_range(0..8));
            let cb = callback(&format!("submission-{}", i));
            timers.debounce(key.clone(), Duration::from_millis(rng.gen_range(3000..5000)), cb.clone());
            expected.insert(key, cb);
            tokio::time::advance(Duration::from_millis(rng.gen_range(0..10))).await;
        }

        let mut fired: HashMap<String, CallbackDescriptor> = HashMap::new();
        while let Some((key, cb)) = timers.next_expired().await {
            assert!(fired.insert(key, cb).is_none(), "key fired twice");
        }
        assert_eq!(fired, expected);
    }
}
