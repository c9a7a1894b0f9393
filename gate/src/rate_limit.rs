//! Fixed-window rate counters for connection and frame budgets

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Counts events in one-second windows
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Records one event; returns false once the window's budget is spent
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

/// One [`RateLimiter`] budget spent by several tasks
#[derive(Debug, Clone)]
pub struct SharedRateLimiter(Arc<Mutex<RateLimiter>>);

impl SharedRateLimiter {
    pub fn new(limiter: RateLimiter) -> Self {
        Self(Arc::new(Mutex::new(limiter)))
    }

    pub fn allow(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).allow()
    }
}
