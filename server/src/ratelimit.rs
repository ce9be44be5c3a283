//! Fixed-window in-memory rate limiter.
//!
//! A bounded map from key to `(count, window_start)`. Expired windows roll
//! over lazily on access; a periodic prune drops expired entries and
//! enforces the size cap by evicting oldest-inserted keys first. Instances
//! are owned collaborators handed to the components that need them, never
//! process globals.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    pub window_ms: i64,
    pub max_in_window: u32,
    pub max_entries: usize,
    /// Entries idle longer than this are dropped by the pruner even if
    /// their window arithmetic would still apply.
    pub prune_age_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

struct Window {
    count: u32,
    window_start: i64,
}

struct Inner {
    entries: HashMap<String, Window>,
    insertion_order: VecDeque<String>,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    /// Count one attempt for `key` at `now`, rolling the window over when
    /// it has expired.
    pub fn check(&self, key: &str, now_ms: i64) -> Decision {
        let mut inner = self.inner.lock().unwrap();
        let config = &self.config;

        if let Some(window) = inner.entries.get_mut(key) {
            if now_ms - window.window_start < config.window_ms {
                return if window.count < config.max_in_window {
                    window.count += 1;
                    Decision {
                        allowed: true,
                        remaining: config.max_in_window - window.count,
                        reset_at_ms: window.window_start + config.window_ms,
                    }
                } else {
                    Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at_ms: window.window_start + config.window_ms,
                    }
                };
            }
            window.count = 1;
            window.window_start = now_ms;
            return Decision {
                allowed: true,
                remaining: config.max_in_window - 1,
                reset_at_ms: now_ms + config.window_ms,
            };
        }

        inner.entries.insert(
            key.to_string(),
            Window {
                count: 1,
                window_start: now_ms,
            },
        );
        inner.insertion_order.push_back(key.to_string());
        Self::enforce_cap(&mut inner, config.max_entries);
        Decision {
            allowed: true,
            remaining: config.max_in_window - 1,
            reset_at_ms: now_ms + config.window_ms,
        }
    }

    /// Drop entries whose window expired longer than `prune_age_ms` ago.
    pub fn prune(&self, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = self.config.window_ms + self.config.prune_age_ms;
        inner
            .entries
            .retain(|_, window| now_ms - window.window_start < cutoff);
        let mut order = std::mem::take(&mut inner.insertion_order);
        order.retain(|key| inner.entries.contains_key(key));
        inner.insertion_order = order;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic pruning task. Aborted by the caller on shutdown.
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.prune(crashline_types::now_ms());
            }
        })
    }

    fn enforce_cap(inner: &mut Inner, max_entries: usize) {
        while inner.entries.len() > max_entries {
            let Some(oldest) = inner.insertion_order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_ms: i64, max: u32, cap: usize) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            window_ms,
            max_in_window: max,
            max_entries: cap,
            prune_age_ms: 0,
        })
    }

    #[test]
    fn counts_down_then_blocks() {
        let limiter = limiter(1_000, 3, 64);
        assert_eq!(
            limiter.check("a", 0),
            Decision {
                allowed: true,
                remaining: 2,
                reset_at_ms: 1_000
            }
        );
        assert!(limiter.check("a", 10).allowed);
        assert!(limiter.check("a", 20).allowed);
        let blocked = limiter.check("a", 30);
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, 0);
        assert_eq!(blocked.reset_at_ms, 1_000);
    }

    #[test]
    fn window_rolls_over_lazily() {
        let limiter = limiter(1_000, 1, 64);
        assert!(limiter.check("a", 0).allowed);
        assert!(!limiter.check("a", 999).allowed);
        let rolled = limiter.check("a", 1_000);
        assert!(rolled.allowed);
        assert_eq!(rolled.reset_at_ms, 2_000);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1_000, 1, 64);
        assert!(limiter.check("a", 0).allowed);
        assert!(limiter.check("b", 0).allowed);
        assert!(!limiter.check("a", 1).allowed);
    }

    #[test]
    fn cap_evicts_oldest_inserted() {
        let limiter = limiter(1_000, 1, 2);
        limiter.check("a", 0);
        limiter.check("b", 0);
        limiter.check("c", 0);
        assert_eq!(limiter.len(), 2);
        // "a" was evicted, so it gets a fresh window.
        assert!(limiter.check("a", 1).allowed);
    }

    #[test]
    fn prune_drops_expired_windows() {
        let limiter = limiter(1_000, 1, 64);
        limiter.check("a", 0);
        limiter.check("b", 500);
        limiter.prune(1_100);
        assert_eq!(limiter.len(), 1);
        limiter.prune(1_600);
        assert!(limiter.is_empty());
    }
}
