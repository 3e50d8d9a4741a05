//! Ban decision rule
//!
//! An address is banned once its accepted attempt count reaches the
//! effective threshold, and only if it is not already banned. A ban
//! persists until an explicit unban; the cooldown only decides whether a
//! repeat crossing is logged as a recent ban.

use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;

use crate::config::ScanConfig;
use crate::models::BanState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanPolicy {
    threshold: u32,
    minimum_attempts: u32,
    cooldown: Duration,
}

impl BanPolicy {
    pub fn new(threshold: u32, minimum_attempts: u32, cooldown: Duration) -> Self {
        BanPolicy {
            threshold,
            minimum_attempts,
            cooldown,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        let seconds = i64::try_from(config.cooldown_seconds)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        Self::new(config.threshold, config.minimum_attempts, Duration::seconds(seconds))
    }

    /// Configured threshold, used for manual bans
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Attempts needed for an automatic ban
    pub fn effective_threshold(&self) -> u32 {
        self.threshold.max(self.minimum_attempts).max(1)
    }

    pub fn should_ban(
        &self,
        address: &IpAddr,
        attempts: u32,
        state: &BanState,
        now: DateTime<Utc>,
    ) -> bool {
        if attempts < self.effective_threshold() {
            return false;
        }

        if state.banned {
            if let Some(banned_at) = state.banned_at {
                let elapsed = now - banned_at;
                if elapsed < self.cooldown {
                    log::debug!(
                        "Skipping re-ban for {}; already banned {}s ago",
                        address,
                        elapsed.num_seconds()
                    );
                }
            }
            return false;
        }

        true
    }
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self::new(10, 10, Duration::seconds(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    fn banned(at: DateTime<Utc>) -> BanState {
        BanState {
            banned: true,
            banned_at: Some(at),
        }
    }

    #[test]
    fn test_below_threshold() {
        let policy = BanPolicy::default();
        assert!(!policy.should_ban(&ip(), 9, &BanState::default(), Utc::now()));
        assert!(policy.should_ban(&ip(), 10, &BanState::default(), Utc::now()));
    }

    #[test]
    fn test_minimum_floor_applies() {
        let policy = BanPolicy::new(3, 10, Duration::seconds(60));
        assert_eq!(policy.effective_threshold(), 10);
        assert_eq!(policy.threshold(), 3);
        assert!(!policy.should_ban(&ip(), 5, &BanState::default(), Utc::now()));
    }

    #[test]
    fn test_never_rebans_while_banned() {
        let policy = BanPolicy::default();
        let now = Utc::now();

        // Within cooldown
        assert!(!policy.should_ban(&ip(), 50, &banned(now - Duration::seconds(5)), now));
        // Long after cooldown
        assert!(!policy.should_ban(&ip(), 50, &banned(now - Duration::days(30)), now));
        // Banned without a timestamp
        let state = BanState { banned: true, banned_at: None };
        assert!(!policy.should_ban(&ip(), 50, &state, now));
    }

    #[test]
    fn test_from_config() {
        let config = crate::config::Config::default();
        let policy = BanPolicy::from_config(&config.scan);
        assert_eq!(policy.effective_threshold(), 10);
    }
}
