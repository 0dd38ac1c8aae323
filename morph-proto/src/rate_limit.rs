//! Sliding-window admission control.
//!
//! Each key keeps a log of admitted timestamps; a call is admitted when fewer
//! than `limit` entries fall inside the trailing window. Entries older than
//! the window are dropped lazily on access, and idle keys are swept at most
//! once per window.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter<K> {
    limit: usize,
    window: Duration,
    log: HashMap<K, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            log: HashMap::new(),
            last_sweep: None,
        }
    }

    pub fn is_allowed(&mut self, key: &K) -> bool {
        self.is_allowed_at(key, Instant::now())
    }

    /// Admit (and record) one call for `key` at `now`.
    pub fn is_allowed_at(&mut self, key: &K, now: Instant) -> bool {
        self.maybe_sweep(now);

        let window = self.window;
        let entries = self.log.entry(key.clone()).or_default();
        while let Some(&oldest) = entries.front() {
            if now.saturating_duration_since(oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= self.limit {
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Calls currently counted against `key`.
    #[cfg(test)]
    fn current_count(&self, key: &K) -> usize {
        self.log.get(key).map_or(0, VecDeque::len)
    }

    #[cfg(test)]
    fn reset(&mut self, key: &K) {
        self.log.remove(key);
    }

    /// Keys with a live entry log; bounded by the periodic sweep.
    pub fn tracked_keys(&self) -> usize {
        self.log.len()
    }

    fn maybe_sweep(&mut self, now: Instant) {
        let due = match self.last_sweep {
            Some(last) => now.saturating_duration_since(last) >= self.window,
            None => true,
        };
        if !due {
            return;
        }
        self.last_sweep = Some(now);
        let window = self.window;
        self.log.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|&newest| now.saturating_duration_since(newest) < window)
        });
    }
}
