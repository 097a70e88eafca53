//! Rate limiting (§4.G): a sliding-window cap on request throughput, plus
//! a separate cap on the number of approvals simultaneously outstanding.
//! Grounded on the `SlidingWindow` in the teacher's security policy
//! module, generalized from a single hard-coded window into one
//! configurable per gateway instance.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A fixed-size, fixed-window counter of recent events. `try_record` is
/// the only mutating entry point, so "check" and "record" can never race
/// against each other within one limiter.
struct SlidingWindow {
    window: Duration,
    max_events: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(window: Duration, max_events: usize) -> Self {
        Self { window, max_events, timestamps: Mutex::new(VecDeque::new()) }
    }

    fn try_record(&self) -> bool {
        let mut ts = self.timestamps.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        while let Some(&front) = ts.front() {
            if now.duration_since(front) >= self.window {
                ts.pop_front();
            } else {
                break;
            }
        }
        if ts.len() >= self.max_events {
            return false;
        }
        ts.push_back(now);
        true
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        let mut ts = self.timestamps.lock().expect("lock");
        let now = Instant::now();
        ts.retain(|&t| now.duration_since(t) < self.window);
        ts.len()
    }
}

/// Request-rate limiting plus an outstanding-approvals cap, per §4.G.
/// Both limits are per gateway instance, not per session — a burst from
/// one pipelined connection still counts against the same budget as any
/// other.
pub struct RateLimiter {
    requests: SlidingWindow,
    max_pending_approvals: usize,
}

impl RateLimiter {
    pub fn new(max_requests_per_window: usize, window: Duration, max_pending_approvals: usize) -> Self {
        Self {
            requests: SlidingWindow::new(window, max_requests_per_window),
            max_pending_approvals,
        }
    }

    /// Default: 60 requests per 60-second window, 10 pending approvals.
    pub fn defaults() -> Self {
        Self::new(60, Duration::from_secs(60), 10)
    }

    /// Record one tool-request attempt; `false` means the caller must
    /// reject it with a `RateLimit` error before touching the policy
    /// engine or the store.
    pub fn try_record_request(&self) -> bool {
        self.requests.try_record()
    }

    /// Whether another `ask` may be opened given `current_pending`
    /// outstanding approvals.
    pub fn can_admit_pending(&self, current_pending: usize) -> bool {
        current_pending < self.max_pending_approvals
    }

    pub fn max_pending_approvals(&self) -> usize {
        self.max_pending_approvals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60), 10);
        assert!(limiter.try_record_request());
        assert!(limiter.try_record_request());
        assert!(limiter.try_record_request());
        assert!(!limiter.try_record_request());
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20), 10);
        assert!(limiter.try_record_request());
        assert!(limiter.try_record_request());
        assert!(!limiter.try_record_request());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_record_request());
    }

    #[test]
    fn pending_cap_is_independent_of_request_rate() {
        let limiter = RateLimiter::new(1000, Duration::from_secs(60), 2);
        assert!(limiter.can_admit_pending(0));
        assert!(limiter.can_admit_pending(1));
        assert!(!limiter.can_admit_pending(2));
    }

    #[test]
    fn count_reflects_only_unexpired_entries() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60), 10);
        limiter.try_record_request();
        limiter.try_record_request();
        assert_eq!(limiter.requests.count(), 2);
    }
}
