//! Per-sender sliding-window rate limiting.
//!
//! Each sender owns an ordered list of send timestamps. An admission check
//! drops expired entries, counts the hour and day windows, and appends the
//! current instant when the send is allowed. A background task prunes idle
//! senders so the table does not grow without bound.
//!
//! Lock order is always table, then sender; neither lock is held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::userli::Quota;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval between background cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Outcome of an admission check.
///
/// On an allowed send the counts include the send just recorded; on a denial
/// they reflect the state that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the message may be sent.
    pub allowed: bool,
    /// Sends within the last hour.
    pub hour_count: usize,
    /// Sends within the last 24 hours.
    pub day_count: usize,
}

/// Send timestamps for a single sender, newest last.
#[derive(Debug, Default)]
struct SenderCounter {
    timestamps: Vec<Instant>,
}

/// Sliding-window rate limiter keyed by sender identity.
pub struct RateLimiter {
    counters: RwLock<HashMap<String, Arc<Mutex<SenderCounter>>>>,
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Check whether `sender` may send another message under `quota` and
    /// record the send if so.
    ///
    /// A quota field of 0 disables that window; with both fields 0 the send
    /// is always admitted (and still recorded). A denial leaves the counter
    /// unchanged apart from dropping expired timestamps.
    pub fn check_and_increment(&self, sender: &str, quota: &Quota) -> Decision {
        let counter = {
            let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(counters.entry(sender.to_string()).or_default())
        };
        let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        counter.timestamps.retain(|ts| now.duration_since(*ts) < DAY);

        let hour_count = counter
            .timestamps
            .iter()
            .filter(|ts| now.duration_since(**ts) < HOUR)
            .count();
        let day_count = counter.timestamps.len();

        if quota.per_hour > 0 && hour_count >= quota.per_hour as usize {
            return Decision {
                allowed: false,
                hour_count,
                day_count,
            };
        }
        if quota.per_day > 0 && day_count >= quota.per_day as usize {
            return Decision {
                allowed: false,
                hour_count,
                day_count,
            };
        }

        counter.timestamps.push(now);
        Decision {
            allowed: true,
            hour_count: hour_count + 1,
            day_count: day_count + 1,
        }
    }

    /// Current hour and day counts for a sender, without recording a send.
    #[must_use]
    pub fn counts(&self, sender: &str) -> (usize, usize) {
        let counter = {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            match counters.get(sender) {
                Some(counter) => Arc::clone(counter),
                None => return (0, 0),
            }
        };
        let counter = counter.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let day_count = counter
            .timestamps
            .iter()
            .filter(|ts| now.duration_since(**ts) < DAY)
            .count();
        let hour_count = counter
            .timestamps
            .iter()
            .filter(|ts| now.duration_since(**ts) < HOUR)
            .count();
        (hour_count, day_count)
    }

    /// Number of senders currently tracked, for the metrics gauge.
    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Spawn the background cleanup task.
    ///
    /// Every five minutes it drops expired timestamps and removes senders
    /// whose counters became empty. The task exits when `shutdown` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => limiter.cleanup(),
                }
            }
        })
    }

    fn cleanup(&self) {
        let now = Instant::now();
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.retain(|_, counter| {
            let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());
            counter.timestamps.retain(|ts| now.duration_since(*ts) < DAY);
            !counter.timestamps.is_empty()
        });
        debug!(
            tracked_senders = counters.len(),
            "rate limiter cleanup pass finished"
        );
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn quota(per_hour: u32, per_day: u32) -> Quota {
        Quota { per_hour, per_day }
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_up_to_hour_limit() {
        let limiter = RateLimiter::new();
        let q = quota(3, 100);

        for expected in 1..=3 {
            let decision = limiter.check_and_increment("a@example.org", &q);
            assert!(decision.allowed);
            assert_eq!(decision.hour_count, expected);
            assert_eq!(decision.day_count, expected);
        }

        let decision = limiter.check_and_increment("a@example.org", &q);
        assert!(!decision.allowed);
        assert_eq!(decision.hour_count, 3);
        assert_eq!(decision.day_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_leaves_state_unchanged() {
        let limiter = RateLimiter::new();
        let q = quota(1, 0);

        assert!(limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(!limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(!limiter.check_and_increment("a@example.org", &q).allowed);

        assert_eq!(limiter.counts("a@example.org"), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_window_slides() {
        let limiter = RateLimiter::new();
        let q = quota(2, 0);

        assert!(limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(!limiter.check_and_increment("a@example.org", &q).allowed);

        advance(HOUR).await;

        let decision = limiter.check_and_increment("a@example.org", &q);
        assert!(decision.allowed);
        assert_eq!(decision.hour_count, 1);
        assert_eq!(decision.day_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_hour_field_disables_hour_window() {
        let limiter = RateLimiter::new();
        let q = quota(0, 3);

        for _ in 0..3 {
            assert!(limiter.check_and_increment("a@example.org", &q).allowed);
        }
        let decision = limiter.check_and_increment("a@example.org", &q);
        assert!(!decision.allowed);
        assert_eq!(decision.day_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_quota_always_allows() {
        let limiter = RateLimiter::new();
        let q = quota(0, 0);

        for expected in 1..=50 {
            let decision = limiter.check_and_increment("a@example.org", &q);
            assert!(decision.allowed);
            assert_eq!(decision.day_count, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_senders_are_independent() {
        let limiter = RateLimiter::new();
        let q = quota(1, 0);

        assert!(limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(!limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(limiter.check_and_increment("b@example.org", &q).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_window_expires() {
        let limiter = RateLimiter::new();
        let q = quota(0, 1);

        assert!(limiter.check_and_increment("a@example.org", &q).allowed);
        assert!(!limiter.check_and_increment("a@example.org", &q).allowed);

        advance(DAY).await;

        assert!(limiter.check_and_increment("a@example.org", &q).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_prunes_idle_senders() {
        let limiter = RateLimiter::new();
        let q = quota(0, 0);

        limiter.check_and_increment("old@example.org", &q);
        advance(DAY).await;
        limiter.check_and_increment("fresh@example.org", &q);

        assert_eq!(limiter.sender_count(), 2);
        limiter.cleanup();
        assert_eq!(limiter.sender_count(), 1);
        assert_eq!(limiter.counts("old@example.org"), (0, 0));
        assert_eq!(limiter.counts("fresh@example.org"), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_never_increases_counts() {
        let limiter = RateLimiter::new();
        let q = quota(0, 0);

        for _ in 0..5 {
            limiter.check_and_increment("a@example.org", &q);
        }
        advance(HOUR * 2).await;
        for _ in 0..3 {
            limiter.check_and_increment("a@example.org", &q);
        }

        let before = limiter.counts("a@example.org");
        limiter.cleanup();
        let after = limiter.counts("a@example.org");
        assert!(after.0 <= before.0);
        assert!(after.1 <= before.1);
        assert_eq!(after, (3, 8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_without_increment() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.counts("nobody@example.org"), (0, 0));

        limiter.check_and_increment("a@example.org", &quota(0, 0));
        assert_eq!(limiter.counts("a@example.org"), (1, 1));
        assert_eq!(limiter.counts("a@example.org"), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_shutdown() {
        let limiter = Arc::new(RateLimiter::new());
        let shutdown = CancellationToken::new();
        let handle = limiter.spawn_cleanup(shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
