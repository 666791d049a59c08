use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::error::{WorkerError, WorkerResult};
use super::types::RateLimitPolicy;

/// Rolling-window usage counters for one definition. Each window is anchored
/// to its own last reset, not to wall-clock boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRateTracker {
    pub definition_id: String,
    pub requests_minute_marker: DateTime<Utc>,
    pub requests_this_minute: u64,
    pub tokens_minute_marker: DateTime<Utc>,
    pub tokens_this_minute: u64,
    pub tokens_day_marker: DateTime<Utc>,
    pub tokens_today: u64,
    pub current_active_instances: u64,
}

impl WorkerRateTracker {
    pub fn new(definition_id: impl Into<String>, active_instances: u64, now: DateTime<Utc>) -> Self {
        Self {
            definition_id: definition_id.into(),
            requests_minute_marker: now,
            requests_this_minute: 0,
            tokens_minute_marker: now,
            tokens_this_minute: 0,
            tokens_day_marker: now,
            tokens_today: 0,
            current_active_instances: active_instances,
        }
    }

    fn reset_expired(&mut self, now: DateTime<Utc>) {
        let minute = Duration::minutes(1);
        if now - self.requests_minute_marker > minute {
            self.requests_minute_marker = now;
            self.requests_this_minute = 0;
        }
        if now - self.tokens_minute_marker > minute {
            self.tokens_minute_marker = now;
            self.tokens_this_minute = 0;
        }
        if now - self.tokens_day_marker > Duration::hours(24) {
            self.tokens_day_marker = now;
            self.tokens_today = 0;
        }
    }

    fn limited(&self, reason: String) -> WorkerError {
        debug!(definition_id = %self.definition_id, %reason, "rate limited");
        WorkerError::RateLimited {
            definition_id: self.definition_id.clone(),
            reason,
        }
    }

    /// Resets due windows, then checks whether one more request carrying
    /// `tokens` tokens fits under every non-zero cap. Records nothing.
    pub fn check_usage(
        &mut self,
        policy: &RateLimitPolicy,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> WorkerResult<()> {
        self.reset_expired(now);
        if exceeds(self.requests_this_minute, 1, policy.max_requests_per_minute) {
            return Err(self.limited(format!(
                "{} requests per minute",
                policy.max_requests_per_minute
            )));
        }
        if exceeds(self.tokens_this_minute, tokens, policy.max_tokens_per_minute) {
            return Err(self.limited(format!(
                "{} tokens per minute",
                policy.max_tokens_per_minute
            )));
        }
        if exceeds(self.tokens_today, tokens, policy.max_tokens_per_day) {
            return Err(self.limited(format!("{} tokens per day", policy.max_tokens_per_day)));
        }
        Ok(())
    }

    /// Check-then-act admission of one request. Callers hold the manager's
    /// write lock across the whole call.
    pub fn check_and_record_usage(
        &mut self,
        policy: &RateLimitPolicy,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> WorkerResult<()> {
        self.check_usage(policy, tokens, now)?;
        self.requests_this_minute += 1;
        self.record_tokens(tokens, now);
        Ok(())
    }

    /// Adds tokens consumed by a call that was already admitted.
    pub fn record_tokens(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.reset_expired(now);
        self.tokens_this_minute = self.tokens_this_minute.saturating_add(tokens);
        self.tokens_today = self.tokens_today.saturating_add(tokens);
    }

    pub fn check_spawn(&self, policy: &RateLimitPolicy) -> WorkerResult<()> {
        let cap = policy.max_concurrent_active_instances;
        if cap > 0 && self.current_active_instances >= cap {
            return Err(self.limited(format!("{} concurrent active instances", cap)));
        }
        Ok(())
    }

    pub fn instance_spawned(&mut self) {
        self.current_active_instances += 1;
    }

    pub fn instance_retired(&mut self) {
        self.current_active_instances = self.current_active_instances.saturating_sub(1);
    }
}

/// Zero caps are unlimited. Otherwise a proposal is rejected only when it
/// would take the counter past the cap.
fn exceeds(count: u64, proposed: u64, cap: u64) -> bool {
    cap > 0 && count.saturating_add(proposed) > cap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn policy(rpm: u64, tpm: u64, tpd: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            max_requests_per_minute: rpm,
            max_tokens_per_minute: tpm,
            max_tokens_per_day: tpd,
            max_concurrent_active_instances: 0,
        }
    }

    #[test]
    fn test_requests_cap_within_window() {
        let now = Utc::now();
        let mut tracker = WorkerRateTracker::new("d", 0, now);
        let policy = policy(2, 0, 0);
        tracker.check_and_record_usage(&policy, 0, now).unwrap();
        tracker.check_and_record_usage(&policy, 0, now).unwrap();
        let err = tracker
            .check_and_record_usage(&policy, 0, now + Duration::seconds(30))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(tracker.requests_this_minute, 2);
    }

    #[test]
    fn test_window_resets_after_elapsed() {
        let now = Utc::now();
        let mut tracker = WorkerRateTracker::new("d", 0, now);
        tracker.requests_minute_marker = now - Duration::seconds(61);
        tracker.requests_this_minute = 1;
        tracker
            .check_and_record_usage(&policy(1, 0, 0), 0, now)
            .unwrap();
        assert_eq!(tracker.requests_this_minute, 1);
        assert_eq!(tracker.requests_minute_marker, now);
    }

    #[test]
    fn test_window_not_reset_at_exact_boundary() {
        let now = Utc::now();
        let mut tracker = WorkerRateTracker::new("d", 0, now);
        tracker.requests_minute_marker = now - Duration::seconds(60);
        tracker.requests_this_minute = 1;
        assert!(tracker.check_usage(&policy(1, 0, 0), 0, now).is_err());
    }

    #[test]
    fn test_token_windows_are_independent() {
        let now = Utc::now();
        let mut tracker = WorkerRateTracker::new("d", 0, now);
        let policy = policy(0, 100, 150);
        tracker.check_and_record_usage(&policy, 90, now).unwrap();
        assert!(tracker.check_usage(&policy, 20, now).is_err());

        // minute window rolls over, day window does not
        let later = now + Duration::seconds(90);
        tracker.check_and_record_usage(&policy, 50, later).unwrap();
        assert_eq!(tracker.tokens_this_minute, 50);
        assert_eq!(tracker.tokens_today, 140);
        let err = tracker.check_usage(&policy, 20, later).unwrap_err();
        assert!(err.to_string().contains("tokens per day"));

        let next_day = now + Duration::hours(25);
        tracker.check_usage(&policy, 20, next_day).unwrap();
        assert_eq!(tracker.tokens_today, 0);
    }

    #[test]
    fn test_token_cap_reached_exactly_still_admits_empty_call() {
        let now = Utc::now();
        let mut tracker = WorkerRateTracker::new("d", 0, now);
        let policy = policy(0, 100, 0);
        tracker.check_and_record_usage(&policy, 100, now).unwrap();
        assert_eq!(tracker.tokens_this_minute, 100);
        tracker.check_usage(&policy, 0, now).unwrap();
        let err = tracker.check_usage(&policy, 1, now).unwrap_err();
        assert!(err.to_string().contains("tokens per minute"));
    }

    #[test]
    fn test_zero_caps_are_unlimited() {
        let now = Utc::now();
        let mut tracker = WorkerRateTracker::new("d", 0, now);
        for _ in 0..1000 {
            tracker
                .check_and_record_usage(&RateLimitPolicy::default(), 1_000_000, now)
                .unwrap();
        }
    }

    #[test]
    fn test_spawn_cap_and_floor() {
        let mut tracker = WorkerRateTracker::new("d", 1, Utc::now());
        let policy = RateLimitPolicy {
            max_concurrent_active_instances: 1,
            ..Default::default()
        };
        assert!(tracker.check_spawn(&policy).is_err());
        tracker.instance_retired();
        tracker.instance_retired();
        assert_eq!(tracker.current_active_instances, 0);
        assert!(tracker.check_spawn(&policy).is_ok());
    }
}
