//! Sliding-window rate limiting, keyed by `"{user}:{action}"`.
//!
//! Each subject keeps the timestamps of its recent permitted calls. On every
//! check, timestamps older than the window are dropped; the call is permitted
//! only if fewer than `limit` remain. Denied calls are not recorded, so a
//! client hammering the limiter does not push its own window forward.
//!
//! Subjects whose window has gone quiet are dropped from the map: the
//! subject being checked as soon as its window empties, everyone else on a
//! periodic sweep.
//!
//! State lives for the lifetime of the process and is never persisted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;

/// Every this many checks, idle subjects are swept from the map.
const SWEEP_INTERVAL: u64 = 64;

/// A call budget: at most `limit` calls per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub limit: usize,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl From<RateLimitConfig> for RateLimit {
    fn from(config: RateLimitConfig) -> Self {
        Self::new(config.limit, config.window())
    }
}

/// Recent permitted calls of one subject.
struct Window {
    span: Duration,
    stamps: VecDeque<Instant>,
}

impl Window {
    fn new(span: Duration) -> Self {
        Self {
            span,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= self.span {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// True once even the newest call has left the window.
    fn is_idle(&self, now: Instant) -> bool {
        self.stamps
            .back()
            .map_or(true, |&newest| now.saturating_duration_since(newest) >= self.span)
    }
}

#[derive(Default)]
struct State {
    windows: HashMap<String, Window>,
    checks: u64,
}

/// Thread-safe per-subject limiter.
///
/// A single `Mutex` guards the whole map: checks are short and never held
/// across an await point.
#[derive(Default)]
pub struct RateLimiter {
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true (and records the call) if `user` may perform `action` now.
    pub fn check(&self, user: &str, action: &str, budget: RateLimit) -> bool {
        self.check_at(user, action, budget, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, user: &str, action: &str, budget: RateLimit, now: Instant) -> bool {
        let key = format!("{user}:{action}");

        // A poisoned lock only means another caller panicked mid-check;
        // the map itself is still usable.
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = &mut *guard;

        state.checks += 1;
        if state.checks % SWEEP_INTERVAL == 0 {
            state.windows.retain(|_, window| !window.is_idle(now));
        }

        let window = state
            .windows
            .entry(key.clone())
            .or_insert_with(|| Window::new(budget.window));
        window.span = budget.window;
        window.prune(now);

        if window.stamps.len() < budget.limit {
            window.stamps.push_back(now);
            return true;
        }

        debug!(user, action, count = window.stamps.len(), "rate limit reached");
        if window.stamps.is_empty() {
            state.windows.remove(&key);
        }
        false
    }

    /// Number of calls currently counted against `user:action`.
    #[cfg(test)]
    fn recent_calls(&self, user: &str, action: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .windows
            .get(&format!("{user}:{action}"))
            .map(|window| window.stamps.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_subjects(&self) -> usize {
        self.state.lock().unwrap().windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn budget(limit: usize, secs: u64) -> RateLimit {
        RateLimit::new(limit, Duration::from_secs(secs))
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at("u1", "code_execution", budget(3, 60), now));
        }
        assert!(!limiter.check_at("u1", "code_execution", budget(3, 60), now));
    }

    #[test]
    fn test_window_expiry_frees_slots() {
        let limiter = RateLimiter::new();
        let start = Instant::now();

        assert!(limiter.check_at("u1", "run", budget(2, 10), start));
        assert!(limiter.check_at("u1", "run", budget(2, 10), start + Duration::from_secs(5)));
        assert!(!limiter.check_at("u1", "run", budget(2, 10), start + Duration::from_secs(9)));

        // First call falls out of the window at exactly start + 10s
        assert!(limiter.check_at("u1", "run", budget(2, 10), start + Duration::from_secs(10)));
        assert!(!limiter.check_at("u1", "run", budget(2, 10), start + Duration::from_secs(11)));
    }

    #[test]
    fn test_denied_calls_are_not_recorded() {
        let limiter = RateLimiter::new();
        let start = Instant::now();

        assert!(limiter.check_at("u1", "run", budget(1, 10), start));
        for s in 1..10 {
            assert!(!limiter.check_at("u1", "run", budget(1, 10), start + Duration::from_secs(s)));
        }
        assert_eq!(limiter.recent_calls("u1", "run"), 1);
        assert!(limiter.check_at("u1", "run", budget(1, 10), start + Duration::from_secs(10)));
    }

    #[test]
    fn test_subjects_are_isolated() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        assert!(limiter.check_at("alice", "run", budget(1, 60), now));
        assert!(!limiter.check_at("alice", "run", budget(1, 60), now));

        // Different user, same action
        assert!(limiter.check_at("bob", "run", budget(1, 60), now));
        // Same user, different action
        assert!(limiter.check_at("alice", "goal", budget(1, 60), now));
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let limiter = RateLimiter::new();
        assert!(!limiter.check("u1", "run", budget(0, 60)));
        assert_eq!(limiter.recent_calls("u1", "run"), 0);
        assert_eq!(limiter.tracked_subjects(), 0);
    }

    #[test]
    fn test_emptied_window_is_dropped_on_denial() {
        let limiter = RateLimiter::new();
        let start = Instant::now();

        assert!(limiter.check_at("u1", "run", budget(1, 10), start));
        assert_eq!(limiter.tracked_subjects(), 1);

        // Budget shrinks to zero after the window has passed
        assert!(!limiter.check_at("u1", "run", budget(0, 10), start + Duration::from_secs(10)));
        assert_eq!(limiter.tracked_subjects(), 0);
    }

    #[test]
    fn test_idle_subjects_are_swept() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(60);

        for n in 0..200 {
            assert!(limiter.check_at(&format!("user{n}"), "run", budget(5, 60), start));
        }
        assert_eq!(limiter.tracked_subjects(), 200);

        // Enough checks after the window to cross a sweep
        for _ in 0..SWEEP_INTERVAL {
            limiter.check_at("active", "run", budget(1000, 60), later);
        }
        assert_eq!(limiter.tracked_subjects(), 1);
        assert_eq!(limiter.recent_calls("active", "run"), SWEEP_INTERVAL as usize);
    }

    #[test]
    fn test_sweep_keeps_subjects_still_in_window() {
        let limiter = RateLimiter::new();
        let start = Instant::now();

        assert!(limiter.check_at("slow", "run", budget(5, 600), start));
        for _ in 0..SWEEP_INTERVAL {
            limiter.check_at("fast", "run", budget(1000, 10), start + Duration::from_secs(30));
        }
        // 30s in: "slow" still has a call inside its 600s window
        assert_eq!(limiter.recent_calls("slow", "run"), 1);
    }

    #[test]
    fn test_concurrent_checks_respect_limit() {
        let limiter = Arc::new(RateLimiter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.check("shared", "run", budget(25, 600)))
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 25);
        assert_eq!(limiter.recent_calls("shared", "run"), 25);
    }

    #[test]
    fn test_from_config() {
        let budget: RateLimit = RateLimitConfig {
            limit: 5,
            window_secs: 300,
        }
        .into();
        assert_eq!(budget.limit, 5);
        assert_eq!(budget.window, Duration::from_secs(300));
    }
}
