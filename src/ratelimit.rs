use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{LimitConfig, LimitsConfig};
use crate::error::JamError;

/// Admission policy: at most `max_attempts` events inside the trailing
/// `window`; once an attempt is rejected because the window is full, a hard
/// `cooldown` starts and every attempt during it is rejected without being
/// recorded. A zero cooldown degrades to purely window-based behavior.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_attempts: u32, window_ms: u64, cooldown_ms: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_millis(window_ms),
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }
}

impl From<LimitConfig> for RateLimitPolicy {
    fn from(c: LimitConfig) -> Self {
        Self::new(c.max_attempts, c.window_ms, c.cooldown_ms)
    }
}

/// Recorded attempts for one identifier. Timestamps are epoch milliseconds
/// rather than `Instant` so entries can cross the snapshot boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterEntry {
    pub timestamps: Vec<i64>,
    pub blocked_until: Option<i64>,
}

impl LimiterEntry {
    fn prune(&mut self, window_ms: i64, now: i64) {
        self.timestamps.retain(|&t| t > now - window_ms);
    }

    fn is_idle(&self) -> bool {
        self.timestamps.is_empty() && self.blocked_until.is_none()
    }
}

/// Sliding-window rate limiter keyed by an arbitrary identifier. Expired
/// timestamps are pruned lazily on the next lookup, never by a sweep.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    entries: DashMap<String, LimiterEntry>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
        }
    }

    /// Admits or rejects an attempt by `identifier`, recording the attempt
    /// on success. Rejected attempts are never recorded.
    pub fn check(&self, identifier: &str) -> Result<(), JamError> {
        self.check_at(identifier, now_ms())
    }

    /// Time until the identifier may act again; zero when currently allowed.
    pub fn remaining_time(&self, identifier: &str) -> Duration {
        self.remaining_time_at(identifier, now_ms())
    }

    /// Attempts left in the current window.
    pub fn remaining_attempts(&self, identifier: &str) -> u32 {
        self.remaining_attempts_at(identifier, now_ms())
    }

    /// Clears all recorded state for the identifier.
    pub fn reset(&self, identifier: &str) {
        self.entries.remove(identifier);
    }

    fn check_at(&self, identifier: &str, now: i64) -> Result<(), JamError> {
        let mut entry = self.entries.entry(identifier.to_string()).or_default();

        if let Some(until) = entry.blocked_until {
            if now < until {
                return Err(JamError::RateLimit {
                    retry_after_ms: (until - now) as u64,
                });
            }
            entry.blocked_until = None;
        }

        entry.prune(self.window_ms(), now);

        if entry.timestamps.len() >= self.policy.max_attempts as usize {
            let retry_after_ms = if self.cooldown_ms() > 0 {
                entry.blocked_until = Some(now + self.cooldown_ms());
                self.cooldown_ms() as u64
            } else {
                entry
                    .timestamps
                    .first()
                    .map(|&t| (t + self.window_ms() - now).max(1) as u64)
                    .unwrap_or(1)
            };
            return Err(JamError::RateLimit { retry_after_ms });
        }

        entry.timestamps.push(now);
        Ok(())
    }

    fn remaining_time_at(&self, identifier: &str, now: i64) -> Duration {
        let Some(mut entry) = self.entries.get_mut(identifier) else {
            return Duration::ZERO;
        };

        if let Some(until) = entry.blocked_until {
            if now < until {
                return Duration::from_millis((until - now) as u64);
            }
            entry.blocked_until = None;
        }

        entry.prune(self.window_ms(), now);

        if entry.timestamps.len() >= self.policy.max_attempts as usize {
            if let Some(&oldest) = entry.timestamps.first() {
                return Duration::from_millis((oldest + self.window_ms() - now).max(0) as u64);
            }
        }

        Duration::ZERO
    }

    fn remaining_attempts_at(&self, identifier: &str, now: i64) -> u32 {
        let Some(mut entry) = self.entries.get_mut(identifier) else {
            return self.policy.max_attempts;
        };
        if let Some(until) = entry.blocked_until {
            if now < until {
                return 0;
            }
            entry.blocked_until = None;
        }
        entry.prune(self.window_ms(), now);
        self.policy
            .max_attempts
            .saturating_sub(entry.timestamps.len() as u32)
    }

    pub fn export(&self) -> HashMap<String, LimiterEntry> {
        self.entries
            .iter()
            .filter(|kv| !kv.value().is_idle())
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect()
    }

    pub fn restore(&self, entries: HashMap<String, LimiterEntry>) {
        self.entries.clear();
        for (identifier, entry) in entries {
            self.entries.insert(identifier, entry);
        }
    }

    fn window_ms(&self) -> i64 {
        self.policy.window.as_millis() as i64
    }

    fn cooldown_ms(&self) -> i64 {
        self.policy.cooldown.as_millis() as i64
    }
}

/// One keyed limiter per rate-limited action category. Chat admission keys
/// are scoped `court_id:identifier`; the rest key by subject id or client IP.
pub struct ActionLimits {
    pub checkin: RateLimiter,
    pub chat_message: RateLimiter,
    pub rating: RateLimiter,
    pub login: RateLimiter,
}

impl ActionLimits {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            checkin: RateLimiter::new(limits.checkin.into()),
            chat_message: RateLimiter::new(limits.chat_message.into()),
            rating: RateLimiter::new(limits.rating.into()),
            login: RateLimiter::new(limits.login.into()),
        }
    }

    /// Clears every action category for the identifier (logout path).
    pub fn reset_identifier(&self, identifier: &str) {
        self.checkin.reset(identifier);
        self.chat_message.reset(identifier);
        self.rating.reset(identifier);
        self.login.reset(identifier);
    }

    pub fn export(&self) -> BTreeMap<String, HashMap<String, LimiterEntry>> {
        let mut out = BTreeMap::new();
        out.insert("checkin".to_string(), self.checkin.export());
        out.insert("chat_message".to_string(), self.chat_message.export());
        out.insert("rating".to_string(), self.rating.export());
        out.insert("login".to_string(), self.login.export());
        out
    }

    pub fn restore(&self, mut map: BTreeMap<String, HashMap<String, LimiterEntry>>) {
        if let Some(entries) = map.remove("checkin") {
            self.checkin.restore(entries);
        }
        if let Some(entries) = map.remove("chat_message") {
            self.chat_message.restore(entries);
        }
        if let Some(entries) = map.remove("rating") {
            self.rating.restore(entries);
        }
        if let Some(entries) = map.remove("login") {
            self.login.restore(entries);
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn window_only(max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitPolicy::new(max, window_ms, 0))
    }

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = window_only(3, 1_000);
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_err());
    }

    #[test]
    fn window_expiry_readmits() {
        let limiter = window_only(3, 300);
        for _ in 0..3 {
            assert!(limiter.check("alice").is_ok());
        }
        assert!(limiter.check("alice").is_err());
        sleep(Duration::from_millis(350));
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn rejected_attempts_are_not_recorded() {
        let limiter = window_only(1, 200);
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_err());
        assert!(limiter.check("alice").is_err());
        // if rejections were recorded the window would keep refilling
        sleep(Duration::from_millis(250));
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = window_only(2, 60_000);
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_err());
        assert!(limiter.check("bob").is_ok());
    }

    #[test]
    fn cooldown_outlasts_the_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(2, 100, 500));
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_ok());
        // trips the limit and starts the cooldown
        let err = limiter.check("alice").unwrap_err();
        assert_eq!(err.retry_after_ms(), Some(500));

        // window has long expired, cooldown still holds
        sleep(Duration::from_millis(200));
        assert!(limiter.check("alice").is_err());

        sleep(Duration::from_millis(350));
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn cooldown_boundary_is_exact() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 1_000, 2_000));
        assert!(limiter.check_at("alice", 10_000).is_ok());
        assert!(limiter.check_at("alice", 10_001).is_err()); // blocked until 12_001
        assert!(limiter.check_at("alice", 12_000).is_err());
        assert!(limiter.check_at("alice", 12_001).is_ok());
    }

    #[test]
    fn retry_after_reflects_remaining_cooldown() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 1_000, 2_000));
        assert!(limiter.check_at("alice", 0).is_ok());
        assert!(limiter.check_at("alice", 100).is_err());
        let err = limiter.check_at("alice", 1_100).unwrap_err();
        assert_eq!(err.retry_after_ms(), Some(1_000));
    }

    #[test]
    fn remaining_attempts_counts_down() {
        let limiter = window_only(3, 60_000);
        assert_eq!(limiter.remaining_attempts("alice"), 3);
        limiter.check("alice").unwrap();
        assert_eq!(limiter.remaining_attempts("alice"), 2);
        limiter.check("alice").unwrap();
        limiter.check("alice").unwrap();
        assert_eq!(limiter.remaining_attempts("alice"), 0);
    }

    #[test]
    fn remaining_time_zero_when_allowed() {
        let limiter = window_only(2, 60_000);
        assert_eq!(limiter.remaining_time("alice"), Duration::ZERO);
        limiter.check("alice").unwrap();
        assert_eq!(limiter.remaining_time("alice"), Duration::ZERO);
    }

    #[test]
    fn remaining_time_tracks_window_and_cooldown() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 1_000, 2_000));
        limiter.check_at("alice", 0).unwrap();
        // window full but no cooldown yet: wait out the oldest timestamp
        assert_eq!(
            limiter.remaining_time_at("alice", 400),
            Duration::from_millis(600)
        );
        // a rejected attempt starts the cooldown
        assert!(limiter.check_at("alice", 500).is_err());
        assert_eq!(
            limiter.remaining_time_at("alice", 1_500),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn reset_clears_identifier_state() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 60_000, 60_000));
        limiter.check("alice").unwrap();
        assert!(limiter.check("alice").is_err());
        limiter.reset("alice");
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn export_restore_keeps_blocks_in_force() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 60_000, 600_000));
        limiter.check("alice").unwrap();
        assert!(limiter.check("alice").is_err());

        let exported = limiter.export();
        let fresh = RateLimiter::new(RateLimitPolicy::new(1, 60_000, 600_000));
        fresh.restore(exported);
        assert!(fresh.check("alice").is_err());
        assert!(fresh.check("bob").is_ok());
    }

    #[test]
    fn attempt_lookup_clears_an_expired_block() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, 100, 200));
        limiter.check_at("alice", 0).unwrap();
        assert!(limiter.check_at("alice", 10).is_err()); // blocked until 210
        assert_eq!(limiter.remaining_attempts_at("alice", 50), 0);

        // block and window both over; the lookup must leave nothing behind
        assert_eq!(limiter.remaining_attempts_at("alice", 300), 1);
        assert!(limiter.export().is_empty());
    }

    #[test]
    fn export_skips_idle_identifiers() {
        let limiter = window_only(5, 50);
        limiter.check("alice").unwrap();
        sleep(Duration::from_millis(80));
        // pruned on next lookup, then idle
        assert_eq!(limiter.remaining_attempts("alice"), 5);
        assert!(limiter.export().is_empty());
    }

    #[test]
    fn action_limits_reset_identifier_covers_all_actions() {
        let limits = ActionLimits::new(&LimitsConfig {
            checkin: LimitConfig {
                max_attempts: 1,
                window_ms: 60_000,
                cooldown_ms: 0,
            },
            chat_message: LimitConfig {
                max_attempts: 1,
                window_ms: 60_000,
                cooldown_ms: 0,
            },
            rating: LimitConfig {
                max_attempts: 1,
                window_ms: 60_000,
                cooldown_ms: 0,
            },
            login: LimitConfig {
                max_attempts: 1,
                window_ms: 60_000,
                cooldown_ms: 0,
            },
        });

        limits.checkin.check("alice").unwrap();
        limits.chat_message.check("1:alice").unwrap();
        assert!(limits.checkin.check("alice").is_err());

        limits.reset_identifier("alice");
        assert!(limits.checkin.check("alice").is_ok());
        // the chat key is court-scoped and untouched by a plain identifier reset
        assert!(limits.chat_message.check("1:alice").is_err());
    }
}
