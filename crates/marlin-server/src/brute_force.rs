// Brute-force admission gate.
//
// One entry per sender fingerprint, holding the time of its last accepted
// attach.  Entries are never garbage-collected within a run; the map is
// bounded by client diversity, not by time.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use marlin_protocol::tuning::{BRUTE_FORCE_INTERVAL_MAX, BRUTE_FORCE_INTERVAL_MIN};

pub struct BruteForceGate {
    interval: Mutex<Duration>,
    senders: Mutex<HashMap<u32, Instant>>,
}

impl BruteForceGate {
    pub fn new(interval: Duration) -> Self {
        BruteForceGate {
            interval: Mutex::new(interval.clamp(BRUTE_FORCE_INTERVAL_MIN, BRUTE_FORCE_INTERVAL_MAX)),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Change the minimum spacing.  The stored value is clamped to
    /// [3 s, 60 s]; returns whether the requested value was inside the
    /// window as given.
    pub async fn set_interval(&self, interval: Duration) -> bool {
        let clamped = interval.clamp(BRUTE_FORCE_INTERVAL_MIN, BRUTE_FORCE_INTERVAL_MAX);
        *self.interval.lock().await = clamped;
        clamped == interval
    }

    pub async fn interval(&self) -> Duration {
        *self.interval.lock().await
    }

    /// Record an attach attempt.  Returns `true` when the attempt must be
    /// rejected; a rejected attempt does not refresh the entry, so a
    /// legitimate retry after the interval succeeds.
    pub async fn is_attack(&self, sender_fp: u32) -> bool {
        let interval = *self.interval.lock().await;
        let now = Instant::now();
        let mut senders = self.senders.lock().await;
        if let Some(last) = senders.get(&sender_fp) {
            if now.duration_since(*last) < interval {
                warn!(sender_fp, "attach attempt inside the brute-force window");
                return true;
            }
        }
        senders.insert(sender_fp, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_attempt_inside_the_window_is_rejected() {
        let gate = BruteForceGate::new(Duration::from_secs(3));
        assert!(!gate.is_attack(42).await);
        assert!(gate.is_attack(42).await);
        // A different sender is unaffected.
        assert!(!gate.is_attack(43).await);
    }

    #[tokio::test]
    async fn rejection_does_not_refresh_the_entry() {
        tokio::time::pause();
        let gate = BruteForceGate::new(Duration::from_secs(3));
        assert!(!gate.is_attack(7).await);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(gate.is_attack(7).await);
        // 3 s after the *accepted* attempt, not the rejected one.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!gate.is_attack(7).await);
    }

    #[tokio::test]
    async fn interval_is_clamped() {
        let gate = BruteForceGate::new(Duration::from_secs(10));
        assert!(!gate.set_interval(Duration::from_millis(1)).await);
        assert_eq!(gate.interval().await, Duration::from_secs(3));
        assert!(!gate.set_interval(Duration::from_secs(600)).await);
        assert_eq!(gate.interval().await, Duration::from_secs(60));
        assert!(gate.set_interval(Duration::from_secs(30)).await);
    }
}
