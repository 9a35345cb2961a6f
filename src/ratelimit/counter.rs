//! Window configuration, window records, and limiter decisions.

use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, TurnstileError};

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Window size and quota for one limiter instance.
///
/// Both values are validated at construction, so a `RateLimitConfig` in hand
/// always describes a usable window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    window_ms: u64,
    max_requests: u64,
}

impl RateLimitConfig {
    /// Create a configuration, rejecting a zero window or a zero quota.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        let window_ms = u64::try_from(window.as_millis()).map_err(|_| {
            TurnstileError::Config(format!("window of {:?} is too large", window))
        })?;

        if window_ms == 0 {
            return Err(TurnstileError::Config(
                "rate limit window must be at least one millisecond".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "rate limit must allow at least one request per window".to_string(),
            ));
        }

        Ok(Self {
            window_ms,
            max_requests,
        })
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Requests permitted per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-identifier count for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// Epoch milliseconds at which the window expires
    pub reset_time: u64,
}

impl WindowRecord {
    /// Open a fresh window at `now` holding the request that opened it.
    pub fn open(now: u64, config: &RateLimitConfig) -> Self {
        Self {
            count: 1,
            reset_time: now.saturating_add(config.window_ms),
        }
    }

    /// A window is over once `now` passes its reset time.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.reset_time
    }
}

/// Outcome of a single limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: u64,
}

impl Decision {
    pub fn allow(remaining: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time,
        }
    }

    pub fn deny(reset_time: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time,
        }
    }

    /// The decision returned when the backing store cannot be consulted.
    pub fn fail_open(config: &RateLimitConfig, now: u64) -> Self {
        Self::allow(
            config.max_requests.saturating_sub(1),
            now.saturating_add(config.window_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_zero_window() {
        let result = RateLimitConfig::new(Duration::ZERO, 10);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_config_rejects_sub_millisecond_window() {
        let result = RateLimitConfig::new(Duration::from_micros(500), 10);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_quota() {
        let result = RateLimitConfig::new(Duration::from_secs(60), 0);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_config_accessors() {
        let config = RateLimitConfig::new(Duration::from_secs(900), 100).unwrap();
        assert_eq!(config.window_ms(), 900_000);
        assert_eq!(config.max_requests(), 100);
        assert_eq!(config.window(), Duration::from_secs(900));
    }

    #[test]
    fn test_window_record_expiry_is_strict() {
        let config = RateLimitConfig::new(Duration::from_millis(1000), 2).unwrap();
        let record = WindowRecord::open(0, &config);

        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, 1000);
        assert!(!record.is_expired(1000));
        assert!(record.is_expired(1001));
    }

    #[test]
    fn test_fail_open_decision() {
        let config = RateLimitConfig::new(Duration::from_millis(1000), 5).unwrap();
        let decision = Decision::fail_open(&config, 42);

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_time, 1042);
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let json = serde_json::to_value(Decision::deny(1000)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "allowed": false, "remaining": 0, "resetTime": 1000 })
        );
    }
}
