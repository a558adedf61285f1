//! # Sliding-Window Rate Limiter
//!
//! Per-client admission control for inbound device messages. Each client owns
//! an ordered list of admission timestamps; every check lazily drops the ones
//! that have left the window before counting.
//!
//! The adaptive mode shrinks the limit linearly while the reported system load
//! is above a threshold, never below half of the base limit, and restores the
//! base limit once load falls back under the threshold.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Load-based scaling of the limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveLimit {
    /// Load fraction (0..=1) above which the limit starts shrinking.
    pub load_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub adaptive: Option<AdaptiveLimit>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            adaptive: None,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; `remaining` more requests fit in the current window.
    Allowed { remaining: usize },
    /// Rejected; the oldest admission leaves the window after `retry_after`.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    /// Last reported load, stored as `f64` bits.
    load: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            load: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if `client` may send one more message now.
    pub fn is_allowed(&self, client: &str) -> bool {
        self.check(client).is_allowed()
    }

    /// Admission check against the configured (possibly load-scaled) limit.
    pub fn check(&self, client: &str) -> Admission {
        self.check_with(client, self.effective_limit(), self.config.window)
    }

    /// # Check With Explicit Limits
    ///
    /// ## Logic:
    /// 1.  Drops timestamps older than `now - window` from the client's list.
    /// 2.  Below `max_requests`: records `now` and admits.
    /// 3.  Otherwise rejects, reporting when the oldest entry expires.
    pub fn check_with(&self, client: &str, max_requests: usize, window: Duration) -> Admission {
        let now = Instant::now();
        let mut windows = self.lock();
        let stamps = windows.entry(client.to_string()).or_default();

        if let Some(cutoff) = now.checked_sub(window) {
            while stamps.front().is_some_and(|t| *t < cutoff) {
                stamps.pop_front();
            }
        }

        if stamps.len() < max_requests {
            stamps.push_back(now);
            Admission::Allowed {
                remaining: max_requests - stamps.len(),
            }
        } else {
            let retry_after = stamps
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now))
                .unwrap_or(window);
            tracing::debug!(client, max_requests, ?retry_after, "rate limit exceeded");
            Admission::Rejected { retry_after }
        }
    }

    /// Unused budget for `client` in the current window.
    pub fn remaining(&self, client: &str) -> usize {
        let limit = self.effective_limit();
        let now = Instant::now();
        let windows = self.lock();
        let used = windows
            .get(client)
            .map(|stamps| match now.checked_sub(self.config.window) {
                Some(cutoff) => stamps.iter().filter(|t| **t >= cutoff).count(),
                None => stamps.len(),
            })
            .unwrap_or(0);
        limit.saturating_sub(used)
    }

    /// Forgets every admission recorded for `client`.
    pub fn reset(&self, client: &str) {
        self.lock().remove(client);
    }

    /// Drops clients with no admissions left in the window. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        if let Some(cutoff) = now.checked_sub(self.config.window) {
            windows.retain(|_, stamps| stamps.back().is_some_and(|t| *t >= cutoff));
        } else {
            windows.retain(|_, stamps| !stamps.is_empty());
        }
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    /// Records the current system load as a fraction in `[0, 1]`.
    pub fn report_load(&self, load: f64) {
        let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };
        self.load.store(load.to_bits(), Ordering::Relaxed);
    }

    pub fn current_load(&self) -> f64 {
        f64::from_bits(self.load.load(Ordering::Relaxed))
    }

    /// The limit in force right now.
    ///
    /// Without adaptive mode, or with load at or below the threshold, this is
    /// `max_requests`. Above it the limit falls linearly to 50% at full load.
    pub fn effective_limit(&self) -> usize {
        let base = self.config.max_requests;
        let Some(adaptive) = self.config.adaptive else {
            return base;
        };
        let load = self.current_load();
        if load <= adaptive.load_threshold {
            return base;
        }

        let headroom = (1.0 - adaptive.load_threshold).max(f64::EPSILON);
        let over = ((load - adaptive.load_threshold) / headroom).min(1.0);
        let scaled = (base as f64 * (1.0 - 0.5 * over)).round() as usize;
        let floor = base.div_ceil(2);
        scaled.max(floor).max(1).min(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_requests: max,
            window: Duration::from_secs(secs),
            adaptive: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn allows_up_to_limit_then_rejects() {
        let rl = limiter(3, 10);
        assert!(rl.is_allowed("dev-1"));
        assert!(rl.is_allowed("dev-1"));
        assert!(rl.is_allowed("dev-1"));
        assert!(!rl.is_allowed("dev-1"));
        assert_eq!(rl.remaining("dev-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_readmits() {
        let rl = limiter(2, 10);
        assert!(rl.is_allowed("dev-1"));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(rl.is_allowed("dev-1"));

        match rl.check("dev-1") {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(6)),
            other => panic!("expected rejection, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(6) + Duration::from_millis(1)).await;
        assert!(rl.is_allowed("dev-1"));
        assert!(!rl.is_allowed("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_isolated() {
        let rl = limiter(1, 10);
        assert!(rl.is_allowed("a"));
        assert!(!rl.is_allowed("a"));
        assert!(rl.is_allowed("b"));
        rl.reset("a");
        assert!(rl.is_allowed("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_limits_per_call() {
        let rl = limiter(100, 60);
        let window = Duration::from_secs(1);
        assert!(rl.check_with("x", 1, window).is_allowed());
        assert!(!rl.check_with("x", 1, window).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_idle_clients() {
        let rl = limiter(5, 10);
        rl.is_allowed("old");
        tokio::time::advance(Duration::from_secs(11)).await;
        rl.is_allowed("fresh");
        assert_eq!(rl.prune_idle(), 1);
        assert_eq!(rl.tracked_clients(), 1);
    }

    #[test]
    fn adaptive_limit_scales_with_load() {
        let rl = RateLimiter::new(RateLimiterConfig {
            max_requests: 100,
            window: Duration::from_secs(60),
            adaptive: Some(AdaptiveLimit { load_threshold: 0.6 }),
        });
        assert_eq!(rl.effective_limit(), 100);

        rl.report_load(0.8);
        assert_eq!(rl.effective_limit(), 75);

        rl.report_load(1.0);
        assert_eq!(rl.effective_limit(), 50);

        rl.report_load(5.0);
        assert_eq!(rl.effective_limit(), 50, "never below half the base limit");

        rl.report_load(0.3);
        assert_eq!(rl.effective_limit(), 100, "base limit restored under threshold");
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_limit_applies_to_admission() {
        let rl = RateLimiter::new(RateLimiterConfig {
            max_requests: 4,
            window: Duration::from_secs(60),
            adaptive: Some(AdaptiveLimit { load_threshold: 0.5 }),
        });
        rl.report_load(1.0);
        assert!(rl.is_allowed("dev"));
        assert!(rl.is_allowed("dev"));
        assert!(!rl.is_allowed("dev"));
    }
}
