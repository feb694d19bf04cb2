//! Fixed-window rate limiting
//!
//! Each [`RateLimiter`] is an independent counter store keyed by an arbitrary
//! string (caller address, connection id). A window opens on the first hit,
//! counts hits until `reset_at`, and is replaced by a fresh window on the
//! first hit at or after `reset_at`. Bursts straddling a boundary can reach
//! `2 * max`; this is an abuse guard, not a quota.

use dashmap::DashMap;
use std::time::Instant;
use tracing::debug;

use crate::config::{Config, RateLimit};
use crate::metrics::METRICS;

/// Counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub reset_at: Instant,
}

/// A named fixed-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    limit: RateLimit,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: RateLimit) -> Self {
        Self {
            name,
            limit,
            windows: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Record a hit for `key` and report whether it is admitted.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, key: &str, now: Instant) -> bool {
        let allowed = match self.windows.get_mut(key) {
            Some(mut window) if now < window.reset_at => {
                if window.count >= self.limit.max {
                    false
                } else {
                    window.count += 1;
                    true
                }
            }
            Some(mut window) => {
                *window = self.fresh_window(now);
                true
            }
            None => {
                // entry() rather than insert(): a concurrent first hit for the
                // same key must land in the same window.
                let mut window = self
                    .windows
                    .entry(key.to_string())
                    .or_insert_with(|| RateWindow {
                        count: 0,
                        reset_at: now + self.limit.window,
                    });
                if window.count >= self.limit.max {
                    false
                } else {
                    window.count += 1;
                    true
                }
            }
        };

        if !allowed {
            METRICS.rate_limited.with_label_values(&[self.name]).inc();
            debug!(limiter = self.name, key = %key, "Rate limit hit");
        }

        allowed
    }

    fn fresh_window(&self, now: Instant) -> RateWindow {
        RateWindow {
            count: 1,
            reset_at: now + self.limit.window,
        }
    }

    /// Current window for `key`, if any.
    pub fn window(&self, key: &str) -> Option<RateWindow> {
        self.windows.get(key).map(|w| *w)
    }

    /// Drop the window for `key`.
    pub fn forget(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Evict every window whose reset time has passed. Returns the number evicted.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| now < window.reset_at);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// The independent limiters used on the admission and event paths.
#[derive(Debug)]
pub struct RateLimiters {
    pub room_creation: RateLimiter,
    pub connections: RateLimiter,
    pub edits: RateLimiter,
    pub runs: RateLimiter,
}

impl RateLimiters {
    pub fn new(config: &Config) -> Self {
        Self {
            room_creation: RateLimiter::new("room_creation", config.room_creation_limit),
            connections: RateLimiter::new("connections", config.connection_limit),
            edits: RateLimiter::new("edits", config.edit_limit),
            runs: RateLimiter::new("runs", config.run_limit),
        }
    }

    fn all(&self) -> [&RateLimiter; 4] {
        [&self.room_creation, &self.connections, &self.edits, &self.runs]
    }

    /// Clear every per-connection window belonging to `connection_key`.
    pub fn forget_connection(&self, connection_key: &str) {
        self.edits.forget(connection_key);
        self.runs.forget(connection_key);
    }

    /// Evict expired windows from every store.
    pub fn evict_expired(&self, now: Instant) -> usize {
        self.all().iter().map(|limiter| limiter.evict_expired(now)).sum()
    }

    pub fn tracked_keys(&self) -> usize {
        self.all().iter().map(|limiter| limiter.len()).sum()
    }
}
