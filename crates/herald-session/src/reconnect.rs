// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Disconnect classification and exponential backoff.

use std::collections::HashSet;
use std::time::Duration;

use herald_config::model::ReconnectConfig;
use rand::Rng;

/// How a disconnect reason is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Never retried (logout, ban, deprecated client).
    Permanent,
    /// Always retried while attempts remain.
    Transient,
    /// In neither list; follows `retry_unclassified`.
    Unclassified,
}

/// What to do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectDecision {
    /// Leave the session disconnected.
    Abandon(DisconnectClass),
    /// The attempt ceiling was passed.
    Exhausted { attempts: u32, max_attempts: u32 },
    /// Rebind the engine after `delay`.
    Retry { delay: Duration },
}

/// Reconnection policy built from `[reconnect]`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    factor: f64,
    max_delay_ms: u64,
    jitter_ratio: f64,
    permanent: HashSet<String>,
    transient: HashSet<String>,
    retry_unclassified: bool,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        let normalize =
            |reasons: &[String]| reasons.iter().map(|r| normalize_reason(r)).collect();
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            factor: config.factor,
            max_delay_ms: config.max_delay_ms,
            jitter_ratio: config.jitter_ratio,
            permanent: normalize(&config.permanent_reasons),
            transient: normalize(&config.transient_reasons),
            retry_unclassified: config.retry_unclassified,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Case-insensitive lookup of `reason` in the configured lists.
    pub fn classify(&self, reason: &str) -> DisconnectClass {
        let reason = normalize_reason(reason);
        if self.permanent.contains(&reason) {
            DisconnectClass::Permanent
        } else if self.transient.contains(&reason) {
            DisconnectClass::Transient
        } else {
            DisconnectClass::Unclassified
        }
    }

    /// `min(base * factor^(attempts-1), cap)`, without jitter.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay_ms as f64 * self.factor.powi(exponent);
        let bounded = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(bounded as u64)
    }

    /// [`base_delay`](Self::base_delay) with symmetric jitter applied.
    pub fn delay(&self, attempts: u32) -> Duration {
        let base = self.base_delay(attempts);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        base.mul_f64(1.0 + spread)
    }

    /// Decides the follow-up for a disconnect, given the already-incremented attempt count.
    pub fn evaluate(&self, reason: &str, attempts: u32) -> ReconnectDecision {
        let class = self.classify(reason);
        let retry = match class {
            DisconnectClass::Permanent => false,
            DisconnectClass::Transient => true,
            DisconnectClass::Unclassified => self.retry_unclassified,
        };
        if !retry {
            return ReconnectDecision::Abandon(class);
        }
        if attempts > self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts,
                max_attempts: self.max_attempts,
            };
        }
        ReconnectDecision::Retry {
            delay: self.delay(attempts),
        }
    }

    /// Whether `attempts` is past the ceiling.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

fn normalize_reason(reason: &str) -> String {
    reason.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> ReconnectPolicy {
        ReconnectPolicy::from_config(&ReconnectConfig {
            jitter_ratio: 0.0,
            ..ReconnectConfig::default()
        })
    }

    #[test]
    fn starts_with_base_delay() {
        let policy = policy_without_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn scales_exponentially_and_caps() {
        let policy = policy_without_jitter();
        assert_eq!(policy.base_delay(2), Duration::from_secs(10));
        assert_eq!(policy.base_delay(3), Duration::from_secs(20));
        assert_eq!(policy.base_delay(4), Duration::from_secs(30));
        assert_eq!(policy.base_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = ReconnectPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(4_500), "{delay:?}");
            assert!(delay <= Duration::from_millis(5_500), "{delay:?}");
        }
    }

    #[test]
    fn logout_is_never_retried() {
        let policy = policy_without_jitter();
        assert_eq!(
            policy.evaluate("LOGOUT", 1),
            ReconnectDecision::Abandon(DisconnectClass::Permanent)
        );
        assert_eq!(policy.classify("logout"), DisconnectClass::Permanent);
    }

    #[test]
    fn navigation_is_retried_after_base_delay() {
        let policy = policy_without_jitter();
        assert_eq!(
            policy.evaluate("NAVIGATION", 1),
            ReconnectDecision::Retry {
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn ceiling_stops_retries() {
        let policy = policy_without_jitter();
        assert!(matches!(
            policy.evaluate("NAVIGATION", 5),
            ReconnectDecision::Retry { .. }
        ));
        assert_eq!(
            policy.evaluate("NAVIGATION", 6),
            ReconnectDecision::Exhausted {
                attempts: 6,
                max_attempts: 5
            }
        );
    }

    #[test]
    fn unclassified_follows_config() {
        let retrying = policy_without_jitter();
        assert!(matches!(
            retrying.evaluate("SOMETHING_ODD", 1),
            ReconnectDecision::Retry { .. }
        ));

        let strict = ReconnectPolicy::from_config(&ReconnectConfig {
            retry_unclassified: false,
            ..ReconnectConfig::default()
        });
        assert_eq!(
            strict.evaluate("SOMETHING_ODD", 1),
            ReconnectDecision::Abandon(DisconnectClass::Unclassified)
        );
    }
}
