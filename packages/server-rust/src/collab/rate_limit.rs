//! Rate limiters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::service::error::RateLimitError;
use crate::traits::{RateLimitScope, RateLimiter};

/// Lets every call through.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedRateLimiter;

impl RateLimiter for UnlimitedRateLimiter {
    fn check_limit(&self, _scope: &RateLimitScope, _key: &str, _cid: &str) -> Result<(), RateLimitError> {
        Ok(())
    }
}

/// At most `limit` calls per `window` for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u64,
}

/// Checks between sweeps of expired windows.
const PRUNE_EVERY: u64 = 1024;

/// Fixed-window counter per `(scope, key)`, with an address deny-list
/// checked before any counting. Expired windows are swept every
/// [`PRUNE_EVERY`] checks.
#[derive(Debug, Default)]
pub struct FixedWindowRateLimiter {
    rules: DashMap<RateLimitScope, RateLimitRule>,
    windows: DashMap<(RateLimitScope, String), Window>,
    denied: RwLock<HashSet<String>>,
    checks: AtomicU64,
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits `scope`. Scopes without a rule are never limited.
    pub fn set_rule(&self, scope: RateLimitScope, rule: RateLimitRule) {
        self.rules.insert(scope, rule);
    }

    pub fn deny_address(&self, address: impl Into<String>) {
        self.denied.write().insert(address.into());
    }

    /// Drops windows that have run out, and windows of scopes that no
    /// longer have a rule.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows.retain(|(scope, _), window| {
            self.rules
                .get(scope)
                .is_some_and(|rule| now.duration_since(window.started) < rule.window)
        });
    }

    /// Number of `(scope, key)` windows currently tracked.
    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check_limit(&self, scope: &RateLimitScope, key: &str, cid: &str) -> Result<(), RateLimitError> {
        if self.denied.read().contains(key) {
            return Err(RateLimitError::AddressNotAllowed {
                address: key.to_string(),
            });
        }
        let Some(rule) = self.rules.get(scope).map(|r| *r) else {
            return Ok(());
        };
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }

        let now = Instant::now();
        let mut window = self
            .windows
            .entry((scope.clone(), key.to_string()))
            .or_insert(Window {
                started: now,
                count: 0,
            });
        if now.duration_since(window.started) >= rule.window {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;

        if window.count > rule.limit {
            tracing::debug!(
                cid = %cid,
                object_type = scope.object_type,
                name = %scope.name,
                key = %key,
                "rate limit reached"
            );
            return Err(RateLimitError::LimitReached {
                scope: format!("{}:{}", scope.object_type, scope.name),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64) -> FixedWindowRateLimiter {
        let l = FixedWindowRateLimiter::new();
        l.set_rule(
            RateLimitScope::channel("orders"),
            RateLimitRule {
                limit,
                window: Duration::from_secs(60),
            },
        );
        l
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets() {
        let l = limiter(2);
        let scope = RateLimitScope::channel("orders");
        assert!(l.check_limit(&scope, "10.0.0.1", "c").is_ok());
        assert!(l.check_limit(&scope, "10.0.0.1", "c").is_ok());
        assert_eq!(
            l.check_limit(&scope, "10.0.0.1", "c"),
            Err(RateLimitError::LimitReached {
                scope: "http_soap:orders".into()
            })
        );
        // Other keys have their own budget.
        assert!(l.check_limit(&scope, "10.0.0.2", "c").is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(l.check_limit(&scope, "10.0.0.1", "c").is_ok());
    }

    #[tokio::test]
    async fn unruled_scopes_pass() {
        let l = limiter(0);
        assert!(l
            .check_limit(&RateLimitScope::service("billing"), "k", "c")
            .is_ok());
    }

    #[tokio::test]
    async fn denied_address_wins() {
        let l = FixedWindowRateLimiter::new();
        l.deny_address("6.6.6.6");
        let err = l
            .check_limit(&RateLimitScope::channel("any"), "6.6.6.6", "c")
            .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::FORBIDDEN);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_windows_are_pruned() {
        let l = limiter(5);
        let scope = RateLimitScope::channel("orders");
        for i in 0..3 {
            l.check_limit(&scope, &format!("10.0.0.{i}"), "c").unwrap();
        }
        assert_eq!(l.tracked_windows(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        l.check_limit(&scope, "10.0.1.1", "c").unwrap();
        l.prune();
        assert_eq!(l.tracked_windows(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_accumulate() {
        let l = limiter(5);
        let scope = RateLimitScope::channel("orders");
        for i in 0..PRUNE_EVERY * 2 {
            l.check_limit(&scope, &format!("key-{i}"), "c").unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        // The last sweep keeps only keys seen within the 60s window.
        assert!(l.tracked_windows() <= 601);
    }
}
