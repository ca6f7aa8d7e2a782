//! Sliding-window rate limiter keyed by resource name.
//!
//! Each resource keeps the admission timestamps of its trailing window behind
//! its own mutex, so `is_allowed` on one resource never contends with another.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Limit for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions allowed within any trailing `window`.
    pub max_requests: usize,
    #[serde(rename = "window_ms", with = "opsdeck_core::serde_duration::millis")]
    pub window: Duration,
}

impl RateLimitConfig {
    #[must_use]
    pub const fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    #[must_use]
    pub const fn per_second(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    #[must_use]
    pub const fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(30)
    }
}

#[derive(Debug)]
struct Window {
    config: RateLimitConfig,
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            timestamps: VecDeque::with_capacity(config.max_requests.min(1024)),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.timestamps.len() < self.config.max_requests {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    fn wait_time(&self, now: Instant) -> Duration {
        self.timestamps.front().map_or(Duration::ZERO, |&oldest| {
            self.config
                .window
                .saturating_sub(now.saturating_duration_since(oldest))
        })
    }
}

/// Sliding-window rate limiter.
///
/// Share one instance (behind `Arc`) between every caller of the resources it
/// guards; admission is atomic per resource.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    overrides: Mutex<HashMap<String, RateLimitConfig>>,
    windows: Mutex<HashMap<String, Arc<Mutex<Window>>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter applying `default_config` to every resource.
    #[must_use]
    pub fn new(default_config: RateLimitConfig) -> Self {
        tracing::debug!(?default_config, "RateLimiter initialized");
        Self {
            default_config,
            overrides: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Set a specific limit for one resource.
    ///
    /// Already-recorded admissions are kept and judged against the new limit.
    pub fn set_limit(&self, resource: &str, config: RateLimitConfig) {
        lock(&self.overrides).insert(resource.to_string(), config);
        if let Some(window) = lock(&self.windows).get(resource) {
            lock(window).config = config;
        }
        tracing::debug!(resource, ?config, "Set custom rate limit");
    }

    /// Limit in force for a resource.
    #[must_use]
    pub fn limit_for(&self, resource: &str) -> RateLimitConfig {
        lock(&self.overrides)
            .get(resource)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Admit one operation on `resource` if its window has room.
    pub fn is_allowed(&self, resource: &str) -> bool {
        self.is_allowed_at(resource, Instant::now())
    }

    /// [`Self::is_allowed`] against an explicit clock reading.
    pub fn is_allowed_at(&self, resource: &str, now: Instant) -> bool {
        let window = self.window(resource);
        let admitted = lock(&window).try_admit(now);
        if !admitted {
            tracing::debug!(resource, "Rate limit reached");
        }
        admitted
    }

    /// Time until the oldest admission in the window expires.
    #[must_use]
    pub fn wait_time(&self, resource: &str) -> Duration {
        self.wait_time_at(resource, Instant::now())
    }

    /// [`Self::wait_time`] against an explicit clock reading.
    #[must_use]
    pub fn wait_time_at(&self, resource: &str, now: Instant) -> Duration {
        lock(&self.windows)
            .get(resource)
            .cloned()
            .map_or(Duration::ZERO, |w| lock(&w).wait_time(now))
    }

    /// Free admissions left in the current window.
    #[must_use]
    pub fn remaining(&self, resource: &str) -> usize {
        let window = self.window(resource);
        let mut window = lock(&window);
        window.evict(Instant::now());
        window.config.max_requests.saturating_sub(window.timestamps.len())
    }

    /// Forget the admissions recorded for one resource.
    pub fn reset(&self, resource: &str) {
        lock(&self.windows).remove(resource);
        tracing::debug!(resource, "Reset rate limit");
    }

    /// Forget every recorded admission.
    pub fn clear_all(&self) {
        lock(&self.windows).clear();
    }

    fn window(&self, resource: &str) -> Arc<Mutex<Window>> {
        let config = self.limit_for(resource);
        let mut windows = lock(&self.windows);
        Arc::clone(
            windows
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Window::new(config)))),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    #[test]
    fn test_window_admits_exactly_max_then_recovers() {
        let limiter = RateLimiter::new(RateLimitConfig::new(3, Duration::from_secs(5)));
        let start = Instant::now();

        assert!(limiter.is_allowed_at("api", start));
        assert!(limiter.is_allowed_at("api", start));
        assert!(limiter.is_allowed_at("api", start));
        assert!(!limiter.is_allowed_at("api", start + Duration::from_secs(1)));

        assert!(limiter.is_allowed_at("api", start + Duration::from_millis(5100)));
    }

    #[test]
    fn test_window_slides_per_admission() {
        let limiter = RateLimiter::new(RateLimitConfig::new(2, Duration::from_secs(10)));
        let start = Instant::now();

        assert!(limiter.is_allowed_at("r", start));
        assert!(limiter.is_allowed_at("r", start + Duration::from_secs(4)));
        assert!(!limiter.is_allowed_at("r", start + Duration::from_secs(9)));
        // Only the first admission has expired.
        assert!(limiter.is_allowed_at("r", start + Duration::from_secs(10)));
        assert!(!limiter.is_allowed_at("r", start + Duration::from_secs(11)));
    }

    #[test]
    fn test_wait_time_tracks_oldest_admission() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(5)));
        let start = Instant::now();
        assert_eq!(limiter.wait_time_at("r", start), Duration::ZERO);

        assert!(limiter.is_allowed_at("r", start));
        assert_eq!(
            limiter.wait_time_at("r", start + Duration::from_secs(2)),
            Duration::from_secs(3)
        );
        assert_eq!(
            limiter.wait_time_at("r", start + Duration::from_secs(7)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_resources_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
        assert!(limiter.is_allowed("sliver"));
        assert!(!limiter.is_allowed("sliver"));
        assert!(limiter.is_allowed("metasploit"));
    }

    #[test]
    fn test_custom_limit_and_reset() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
        limiter.set_limit("bulk", RateLimitConfig::new(3, Duration::from_secs(60)));
        assert_eq!(limiter.remaining("bulk"), 3);

        assert!(limiter.is_allowed("bulk"));
        assert!(limiter.is_allowed("bulk"));
        assert_eq!(limiter.remaining("bulk"), 1);

        limiter.reset("bulk");
        assert_eq!(limiter.remaining("bulk"), 3);
        assert_eq!(limiter.limit_for("other").max_requests, 1);
    }

    #[test]
    fn test_concurrent_callers_never_exceed_limit() {
        const MAX: usize = 10;
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(
            MAX,
            Duration::from_secs(60),
        )));
        let admitted = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if limiter.is_allowed("shared") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), MAX);
        assert_eq!(limiter.remaining("shared"), 0);
    }

    #[test]
    fn test_config_from_json_uses_millis() {
        let config: RateLimitConfig =
            serde_json::from_str(r#"{"max_requests": 5, "window_ms": 2500}"#).unwrap();
        assert_eq!(config, RateLimitConfig::new(5, Duration::from_millis(2500)));
    }
}
