//! Per-IP fixed-window rate limiting.
//!
//! In-process only: adequate for a single-instance deployment, a shared
//! store would be needed to scale horizontally.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

/// Login attempts allowed per IP per minute.
pub const LOGIN_LIMIT_PER_MIN: u32 = 5;

/// Refresh attempts allowed per IP per minute.
pub const REFRESH_LIMIT_PER_MIN: u32 = 10;

#[derive(Default)]
struct Window {
    minute: i64,
    count: u32,
}

/// Fixed-window counter keyed by (client key, scope).
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, &'static str), Window>>,
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit and report whether it is within the limit.
    ///
    /// The window is the current wall-clock minute; a new minute resets
    /// the counter.
    pub fn check(&self, key: &str, scope: &'static str, limit: u32) -> bool {
        let minute = Utc::now().timestamp() / 60;
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            // A poisoned lock only means another request panicked mid-insert;
            // failing open here would disable limiting entirely.
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = windows.entry((key.to_string(), scope)).or_default();
        if window.minute != minute {
            window.minute = minute;
            window.count = 0;
        }
        window.count += 1;
        window.count <= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.check("1.2.3.4", "login", 5));
        }
        assert!(!limiter.check("1.2.3.4", "login", 5));
    }

    #[test]
    fn scopes_and_keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.check("1.2.3.4", "login", 5));
        }
        assert!(!limiter.check("1.2.3.4", "login", 5));
        // Different IP and different scope still pass.
        assert!(limiter.check("5.6.7.8", "login", 5));
        assert!(limiter.check("1.2.3.4", "refresh", 10));
    }
}
