//! Gateway configuration: typed, builder-driven, validated at startup.
//!
//! Every knob is an enumerated field, not a loose map; bad values fail at
//! `Gateway::new`, not at first use. `from_env` reads `GATEWAY_*` variables
//! with parse-or-default semantics.

use std::env;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::ratelimit::TierPolicies;
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// MemoryStore capacity in entries.
    pub memory_capacity: NonZeroUsize,
    pub cache: CacheConfig,
    pub tiers: TierPolicies,
    /// Connection string for the distributed backend; `None` runs
    /// memory-only (no fallback composition).
    pub redis_url: Option<String>,
    /// Per-operation timeout for the distributed backend.
    pub op_timeout: Duration,
    /// Consecutive failures before the fallback circuit opens.
    pub breaker_threshold: u32,
    /// How long the circuit stays open before re-probing.
    pub breaker_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            memory_capacity: NonZeroUsize::new(2048).unwrap(),
            cache: CacheConfig::default(),
            tiers: TierPolicies::default(),
            redis_url: None,
            op_timeout: Duration::from_millis(250),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_tiers(mut self, tiers: TierPolicies) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    /// Build a config from `GATEWAY_*` environment variables, starting from
    /// defaults. Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            if !url.trim().is_empty() {
                config.redis_url = Some(url);
            }
        }
        if let Some(capacity) = env_parse::<usize>("GATEWAY_MEMORY_CAPACITY") {
            match NonZeroUsize::new(capacity) {
                Some(n) => config.memory_capacity = n,
                None => tracing::warn!("GATEWAY_MEMORY_CAPACITY=0 ignored"),
            }
        }
        if let Some(ms) = env_parse::<u64>("GATEWAY_OP_TIMEOUT_MS") {
            config.op_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse::<u32>("GATEWAY_BREAKER_THRESHOLD") {
            config.breaker_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("GATEWAY_BREAKER_COOLDOWN_SECS") {
            config.breaker_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("GATEWAY_PURE_TTL_SECS") {
            config.cache.pure_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("GATEWAY_VOLATILE_TTL_SECS") {
            config.cache.volatile_ttl = Duration::from_secs(secs);
        }
        if let Some(limit) = env_parse::<u32>("GATEWAY_ANONYMOUS_LIMIT") {
            config.tiers.anonymous.limit = limit;
        }
        if let Some(secs) = env_parse::<u64>("GATEWAY_ANONYMOUS_WINDOW_SECS") {
            config.tiers.anonymous.window = Duration::from_secs(secs);
        }
        if let Some(limit) = env_parse::<u32>("GATEWAY_AUTHENTICATED_LIMIT") {
            config.tiers.authenticated.limit = limit;
        }
        if let Some(limit) = env_parse::<u32>("GATEWAY_ADMIN_LIMIT") {
            config.tiers.admin.limit = limit;
        }

        config
    }

    /// Validate the whole table before anything starts serving.
    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;
        self.cache.validate()?;
        if self.breaker_threshold == 0 {
            return Err(Error::configuration_with_context(
                "breaker threshold must be >= 1",
                ErrorContext::new()
                    .with_field_path("breaker_threshold")
                    .with_source("config_validator"),
            ));
        }
        if self.op_timeout.is_zero() {
            return Err(Error::configuration_with_context(
                "operation timeout must be positive",
                ErrorContext::new()
                    .with_field_path("op_timeout")
                    .with_source("config_validator"),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%name, %raw, "unparseable value, using default");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TierPolicy;

    #[test]
    fn test_defaults_validate() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_knobs_rejected() {
        let zero_threshold = GatewayConfig::default().with_breaker(0, Duration::from_secs(30));
        assert!(zero_threshold.validate().is_err());

        let zero_timeout = GatewayConfig::default().with_op_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let bad_tier = GatewayConfig::default().with_tiers(
            TierPolicies::default().with_anonymous(TierPolicy::new(0, Duration::from_secs(60))),
        );
        assert!(bad_tier.validate().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let config = GatewayConfig::new()
            .with_redis_url("redis://127.0.0.1:6379")
            .with_op_timeout(Duration::from_millis(100))
            .with_breaker(3, Duration::from_secs(10));
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.breaker_threshold, 3);
        assert!(config.validate().is_ok());
    }
}
