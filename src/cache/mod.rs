//! 响应缓存层：按路由类别决定 TTL，并遵循请求端 cache-control 指令。
//!
//! # Cache Layer
//!
//! Memoizes successful downstream responses keyed by request fingerprint.
//! The layer owns TTL policy (per route class) and the interpretation of
//! request `Cache-Control` directives; the gateway decides when to call
//! `lookup` vs `store`.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheLayer`] | Lookup/store over a [`Store`] with stats and events |
//! | [`CacheConfig`] | Route-class TTLs, entry size limit, key namespace |
//! | [`RouteClass`] | `Pure` / `Volatile` / `Uncacheable` TTL classes |
//! | [`CacheControl`] | Parsed request directive (`no-cache` / `no-store`) |
//! | [`CachedResponse`] | Stored payload plus the metadata to replay it |
//! | [`CacheStats`] | Atomic hit/miss/store/error counters |

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::{self, GatewayEvent};
use crate::key::CacheKey;
use crate::store::Store;
use crate::{Error, ErrorContext, Result};

/// TTL class of a route.
///
/// Pure conversions depend only on their input and cache long; "now"-style
/// endpoints go stale within seconds; some routes are never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Pure,
    Volatile,
    Uncacheable,
}

/// Request-side cache directive. `no-cache` bypasses lookup but still
/// stores for subsequent callers; `no-store` suppresses the store as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    Default,
    NoCache,
    NoStore,
}

impl CacheControl {
    pub fn parse(header: Option<&str>) -> Self {
        let Some(value) = header else {
            return CacheControl::Default;
        };
        let lowered = value.to_ascii_lowercase();
        if lowered.split(',').any(|d| d.trim() == "no-store") {
            CacheControl::NoStore
        } else if lowered.split(',').any(|d| d.trim() == "no-cache") {
            CacheControl::NoCache
        } else {
            CacheControl::Default
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL for input-determined conversion routes.
    pub pure_ttl: Duration,
    /// TTL for current-time routes.
    pub volatile_ttl: Duration,
    /// Path-prefix to route-class table; first prefix match wins.
    pub route_classes: Vec<(String, RouteClass)>,
    /// Class for paths matching no prefix.
    pub default_class: RouteClass,
    pub max_entry_size: usize,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pure_ttl: Duration::from_secs(3600),
            volatile_ttl: Duration::from_secs(2),
            route_classes: vec![
                ("/now".to_string(), RouteClass::Volatile),
                ("/convert".to_string(), RouteClass::Pure),
            ],
            default_class: RouteClass::Pure,
            max_entry_size: 1024 * 1024,
            key_prefix: "cache".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_pure_ttl(mut self, ttl: Duration) -> Self {
        self.pure_ttl = ttl;
        self
    }

    pub fn with_volatile_ttl(mut self, ttl: Duration) -> Self {
        self.volatile_ttl = ttl;
        self
    }

    pub fn with_route_class(mut self, prefix: impl Into<String>, class: RouteClass) -> Self {
        self.route_classes.insert(0, (prefix.into(), class));
        self
    }

    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }

    pub fn class_for(&self, path: &str) -> RouteClass {
        self.route_classes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, class)| *class)
            .unwrap_or(self.default_class)
    }

    pub fn ttl_for(&self, class: RouteClass) -> Option<Duration> {
        match class {
            RouteClass::Pure => Some(self.pure_ttl),
            RouteClass::Volatile => Some(self.volatile_ttl),
            RouteClass::Uncacheable => None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_entry_size == 0 {
            return Err(Error::configuration_with_context(
                "max_entry_size must be positive",
                ErrorContext::new()
                    .with_field_path("cache.max_entry_size")
                    .with_source("config_validator"),
            ));
        }
        Ok(())
    }
}

/// A cached downstream response: the payload plus the metadata needed to
/// reconstruct the original response without re-deriving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct CacheLayer {
    config: CacheConfig,
    store: Arc<dyn Store>,
    stats: Arc<AtomicStats>,
}

impl CacheLayer {
    pub fn new(config: CacheConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(AtomicStats::new()),
        }
    }

    /// Look up a memoized response.
    ///
    /// Store failures and undecodable entries degrade to a miss; the cache
    /// being unhealthy never makes the request fail. Every consulted lookup
    /// emits a hit/miss event with the observed latency.
    pub async fn lookup(&self, key: &CacheKey, path: &str) -> Option<CachedResponse> {
        if !self.config.enabled || self.config.ttl_for(self.config.class_for(path)).is_none() {
            return None;
        }
        let started = Instant::now();
        let prefixed = self.prefixed(key);
        let outcome = match self.store.get(&prefixed).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CachedResponse>(&bytes) {
                Ok(response) => Some(response),
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                None
            }
        };
        let hit = outcome.is_some();
        if hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        events::emit(GatewayEvent::CacheLookup {
            key: key.as_str().to_string(),
            hit,
            latency_ms: started.elapsed().as_millis() as u64,
        })
        .await;
        outcome
    }

    /// Memoize a downstream response.
    ///
    /// Fire-and-forget contract: failures are logged, counted, and
    /// discarded; this method never returns an error and the gateway never
    /// waits on it from the response path. Only 2xx responses are stored,
    /// whatever the downstream's own caching headers say.
    pub async fn store(
        &self,
        key: &CacheKey,
        path: &str,
        response: &CachedResponse,
        ttl_override: Option<Duration>,
    ) {
        if !self.config.enabled {
            return;
        }
        if !(200..300).contains(&response.status) {
            return;
        }
        let ttl = match ttl_override.or_else(|| self.config.ttl_for(self.config.class_for(path))) {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => return,
        };
        let bytes = match serde_json::to_vec(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        if bytes.len() > self.config.max_entry_size {
            return;
        }
        let prefixed = self.prefixed(key);
        match self.store.set(&prefixed, &bytes, ttl).await {
            Ok(()) => {
                self.stats.stores.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "cache store failed, discarding entry");
                events::emit(GatewayEvent::CacheStoreFailed {
                    key: key.as_str().to_string(),
                })
                .await;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn prefixed(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.config.key_prefix, key.as_str())
    }
}
