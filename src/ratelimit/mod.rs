//! 限流模块：基于固定窗口计数的按身份限流，后端故障时保守拒绝。
//!
//! # Rate Limiting Module
//!
//! Fixed-window-with-rolling-approximation counters per identity, stored in
//! the shared [`Store`] abstraction under the `rl:` namespace. The window
//! costs O(1) storage per identity; exact enforcement under concurrent
//! increments is only guaranteed where the backend has an atomic
//! increment-with-TTL (memory, redis), otherwise a small transient
//! overshoot within one window is accepted.
//!
//! Degradation is fail-closed: if the store cannot answer even through its
//! fallback tier, the request is denied, never waved through.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::events::{self, GatewayEvent};
use crate::store::Store;
use crate::{Error, ErrorContext, Result};

const KEY_PREFIX: &str = "rl";

/// Caller tier resolved by upstream authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Anonymous,
    Authenticated,
    Admin,
}

impl Tier {
    /// Resolve a tier label. Unknown or missing labels map to the most
    /// restrictive tier.
    pub fn parse(label: Option<&str>) -> Tier {
        match label.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("authenticated") => Tier::Authenticated,
            Some("admin") => Tier::Admin,
            _ => Tier::Anonymous,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl TierPolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Static per-tier policy table, validated at startup.
#[derive(Debug, Clone)]
pub struct TierPolicies {
    pub anonymous: TierPolicy,
    pub authenticated: TierPolicy,
    pub admin: TierPolicy,
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            anonymous: TierPolicy::new(60, Duration::from_secs(60)),
            authenticated: TierPolicy::new(300, Duration::from_secs(60)),
            admin: TierPolicy::new(1200, Duration::from_secs(60)),
        }
    }
}

impl TierPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anonymous(mut self, policy: TierPolicy) -> Self {
        self.anonymous = policy;
        self
    }

    pub fn with_authenticated(mut self, policy: TierPolicy) -> Self {
        self.authenticated = policy;
        self
    }

    pub fn with_admin(mut self, policy: TierPolicy) -> Self {
        self.admin = policy;
        self
    }

    pub fn resolve(&self, tier: Tier) -> TierPolicy {
        match tier {
            Tier::Anonymous => self.anonymous,
            Tier::Authenticated => self.authenticated,
            Tier::Admin => self.admin,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, policy) in [
            ("anonymous", self.anonymous),
            ("authenticated", self.authenticated),
            ("admin", self.admin),
        ] {
            if policy.limit == 0 {
                return Err(Error::configuration_with_context(
                    "tier limit must be >= 1",
                    ErrorContext::new()
                        .with_field_path(format!("tiers.{}.limit", name))
                        .with_source("config_validator"),
                ));
            }
            if policy.window < Duration::from_secs(1) {
                return Err(Error::configuration_with_context(
                    "tier window must be >= 1s",
                    ErrorContext::new()
                        .with_field_path(format!("tiers.{}.window", name))
                        .with_source("config_validator"),
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Positive only on deny: time until the current window ends.
    pub retry_after_ms: u64,
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    policies: TierPolicies,
}

impl RateLimiter {
    pub fn new(policies: TierPolicies, store: Arc<dyn Store>) -> Self {
        Self { store, policies }
    }

    /// Check and consume one unit of quota for `identity`.
    ///
    /// Uses the backend's atomic increment when available; otherwise falls
    /// back to read-modify-write, accepting the documented race margin.
    /// A store error denies the request.
    pub async fn check(&self, identity: &str, tier: Tier) -> RateDecision {
        let policy = self.policies.resolve(tier);
        // A limiter can be built without going through config validation;
        // clamp so a zero window cannot divide by zero.
        let window_ms = (policy.window.as_millis() as u64).max(1);
        let now_ms = unix_now_ms();
        let window_start = now_ms / window_ms * window_ms;
        let key = counter_key(identity, window_start);
        let window_remaining_ms = window_start + window_ms - now_ms;

        let decision = match self.store.incr(&key, policy.window).await {
            Ok(Some(count)) => Self::decide(policy, count, window_remaining_ms),
            Ok(None) => self
                .check_read_modify_write(&key, policy, window_remaining_ms)
                .await,
            Err(e) => {
                // Fail-closed: an unanswerable store denies, never allows.
                tracing::warn!(identity, error = %e, "rate-limit store error, denying");
                RateDecision {
                    allowed: false,
                    limit: policy.limit,
                    remaining: 0,
                    retry_after_ms: window_remaining_ms.max(1),
                }
            }
        };

        events::emit(GatewayEvent::RateDecision {
            identity: identity.to_string(),
            tier: tier.as_str().to_string(),
            allowed: decision.allowed,
            remaining: decision.remaining,
        })
        .await;
        decision
    }

    /// Path for backends without atomic increment. Racing increments for
    /// the same identity may transiently lose counts here; enforcement is
    /// still eventual within one window.
    async fn check_read_modify_write(
        &self,
        key: &str,
        policy: TierPolicy,
        window_remaining_ms: u64,
    ) -> RateDecision {
        let current = match self.store.get(key).await {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "rate-limit store error, denying");
                return RateDecision {
                    allowed: false,
                    limit: policy.limit,
                    remaining: 0,
                    retry_after_ms: window_remaining_ms.max(1),
                };
            }
        };
        if current >= policy.limit as u64 {
            return Self::decide(policy, current + 1, window_remaining_ms);
        }
        let next = current + 1;
        if let Err(e) = self
            .store
            .set(key, next.to_string().as_bytes(), policy.window)
            .await
        {
            tracing::warn!(error = %e, "rate-limit store error, denying");
            return RateDecision {
                allowed: false,
                limit: policy.limit,
                remaining: 0,
                retry_after_ms: window_remaining_ms.max(1),
            };
        }
        Self::decide(policy, next, window_remaining_ms)
    }

    fn decide(policy: TierPolicy, count: u64, window_remaining_ms: u64) -> RateDecision {
        if count <= policy.limit as u64 {
            RateDecision {
                allowed: true,
                limit: policy.limit,
                remaining: policy.limit - count as u32,
                retry_after_ms: 0,
            }
        } else {
            RateDecision {
                allowed: false,
                limit: policy.limit,
                remaining: 0,
                retry_after_ms: window_remaining_ms.max(1),
            }
        }
    }

    /// Administrative reset: drop the identity's current-window counter.
    /// Counters are otherwise cleaned up by the store's own TTL.
    pub async fn reset(&self, identity: &str, tier: Tier) -> Result<bool> {
        let policy = self.policies.resolve(tier);
        let window_ms = (policy.window.as_millis() as u64).max(1);
        let window_start = unix_now_ms() / window_ms * window_ms;
        self.store.delete(&counter_key(identity, window_start)).await
    }

    pub fn policies(&self) -> &TierPolicies {
        &self.policies
    }
}

fn counter_key(identity: &str, window_start_ms: u64) -> String {
    format!("{}:{}:{}", KEY_PREFIX, identity, window_start_ms)
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
