//! 网关组装模块：限流 → 缓存 → 下游处理器的固定流水线。
//!
//! # Gateway Composition
//!
//! One pipeline per request, strictly ordered and non-branching on the
//! success path:
//!
//! `RECEIVED -> RATE_CHECKED -> CACHE_CHECKED -> (HANDLER_EXECUTED | CACHE_HIT) -> RESPONDED`
//!
//! A denied rate check short-circuits to 429 without consulting the cache;
//! a cache hit short-circuits past the downstream handler. Infrastructure
//! failures degrade the feature (miss for caching, deny for rate limiting)
//! and are never visible to callers as errors.

use async_trait::async_trait;
use std::sync::Arc;

use crate::cache::{CacheControl, CacheLayer, CacheStats, CachedResponse};
use crate::config::GatewayConfig;
use crate::key::KeyCodec;
use crate::ratelimit::{RateDecision, RateLimiter, Tier};
use crate::store::{FallbackStore, MemoryStore, RedisStore, Store, StoreHealth};
use crate::{Error, Result};

pub const HEADER_CACHE: &str = "X-Cache";
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// An inbound request, as handed over by the host HTTP framework.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    /// Normalized-later query/body parameters; duplicates keep the last value.
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Direct connection address, if the host framework provides one.
    pub remote_addr: Option<String>,
    /// Verified user id from upstream authentication, if any.
    pub user_id: Option<String>,
    pub tier: Tier,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            remote_addr: None,
            user_id: None,
            tier: Tier::Anonymous,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, tier: Tier) -> Self {
        self.user_id = Some(user_id.into());
        self.tier = tier;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What the downstream conversion logic returns. The gateway imposes no
/// contract beyond this shape.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }
}

/// The downstream handler: a black box from the gateway's point of view.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: &GatewayRequest) -> Result<HandlerResponse>;
}

/// The response handed back to the host framework.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl GatewayResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Gateway {
    codec: KeyCodec,
    limiter: RateLimiter,
    cache: Arc<CacheLayer>,
    handler: Arc<dyn Handler>,
    fallback: Option<Arc<FallbackStore>>,
}

impl Gateway {
    /// Build the full composition from config: store stack (redis behind a
    /// fallback circuit when configured, memory-only otherwise), cache
    /// layer, and rate limiter sharing one store under disjoint namespaces.
    pub fn new(config: GatewayConfig, handler: Arc<dyn Handler>) -> Result<Self> {
        config.validate()?;
        let memory = Arc::new(MemoryStore::new(config.memory_capacity));
        let (store, fallback): (Arc<dyn Store>, Option<Arc<FallbackStore>>) =
            match &config.redis_url {
                Some(url) => {
                    let redis = Arc::new(RedisStore::new(url, config.op_timeout)?);
                    let fb = Arc::new(FallbackStore::new(
                        redis,
                        memory,
                        config.breaker_threshold,
                        config.breaker_cooldown,
                    ));
                    (Arc::clone(&fb) as Arc<dyn Store>, Some(fb))
                }
                None => (memory as Arc<dyn Store>, None),
            };
        Ok(Self::assemble(config, store, fallback, handler))
    }

    /// Build against a caller-provided store (used by tests and by hosts
    /// that manage their own backend composition).
    pub fn with_store(
        config: GatewayConfig,
        store: Arc<dyn Store>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, store, None, handler))
    }

    fn assemble(
        config: GatewayConfig,
        store: Arc<dyn Store>,
        fallback: Option<Arc<FallbackStore>>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let cache = Arc::new(CacheLayer::new(config.cache.clone(), Arc::clone(&store)));
        let limiter = RateLimiter::new(config.tiers.clone(), store);
        Self {
            codec: KeyCodec::new(),
            limiter,
            cache,
            handler,
            fallback,
        }
    }

    /// Handle one request through the fixed pipeline.
    ///
    /// Rate checking happens strictly before cache lookup, so every
    /// request, hit or miss, consumes one unit of quota.
    pub async fn handle(&self, request: &GatewayRequest) -> GatewayResponse {
        // RATE_CHECKED
        let identity = self.codec.derive_identity(
            request.user_id.as_deref(),
            request.header("x-forwarded-for"),
            request.header("x-real-ip"),
            request.remote_addr.as_deref(),
        );
        let decision = self.limiter.check(&identity, request.tier).await;
        if !decision.allowed {
            return Self::rate_limited(&decision);
        }

        let key = match self
            .codec
            .derive_cache_key(&request.method, &request.path, &request.params)
        {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "request could not be normalized into a key");
                return Self::error_response(
                    400,
                    "INVALID_REQUEST",
                    "request could not be validated",
                    &decision,
                );
            }
        };

        // CACHE_CHECKED
        let cache_control = CacheControl::parse(request.header("cache-control"));
        if cache_control != CacheControl::NoCache {
            if let Some(hit) = self.cache.lookup(&key, &request.path).await {
                return Self::respond(hit.status, hit.content_type, hit.body, &decision, "HIT");
            }
        }

        // HANDLER_EXECUTED
        let response = match self.handler.call(request).await {
            Ok(response) => response,
            Err(Error::Validation { .. }) => {
                return Self::error_response(
                    400,
                    "INVALID_REQUEST",
                    "request could not be validated",
                    &decision,
                );
            }
            Err(e) => {
                // Full context stays server-side; the caller gets a generic body.
                tracing::error!(error = %e, path = %request.path, "downstream handler failed");
                return Self::error_response(
                    500,
                    "INTERNAL_ERROR",
                    "an internal error occurred",
                    &decision,
                );
            }
        };

        if cache_control != CacheControl::NoStore {
            let cache = Arc::clone(&self.cache);
            let path = request.path.clone();
            let entry = CachedResponse {
                status: response.status,
                content_type: response.content_type.clone(),
                body: response.body.clone(),
            };
            let key = key.clone();
            // Fire-and-forget: the response below never waits on this write.
            tokio::spawn(async move {
                cache.store(&key, &path, &entry, None).await;
            });
        }

        Self::respond(
            response.status,
            response.content_type,
            response.body,
            &decision,
            "MISS",
        )
    }

    /// Cache hit/miss counters for the composed cache layer.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fallback circuit snapshot, when a distributed backend is configured.
    pub fn store_health(&self) -> Option<StoreHealth> {
        self.fallback.as_ref().map(|fb| fb.health())
    }

    /// Administrative reset of an identity's current rate-limit window.
    pub async fn reset_rate_limit(&self, identity: &str, tier: Tier) -> Result<bool> {
        self.limiter.reset(identity, tier).await
    }

    fn rate_limited(decision: &RateDecision) -> GatewayResponse {
        let retry_after_secs = decision.retry_after_ms.div_ceil(1000);
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": "RATE_LIMIT_EXCEEDED",
                "retryAfterMs": decision.retry_after_ms,
            }
        });
        let mut response = Self::respond_raw(429, body.to_string().into_bytes(), decision);
        response
            .headers
            .push((HEADER_RETRY_AFTER.to_string(), retry_after_secs.to_string()));
        response
    }

    fn error_response(
        status: u16,
        code: &str,
        message: &str,
        decision: &RateDecision,
    ) -> GatewayResponse {
        let body = serde_json::json!({
            "success": false,
            "error": { "code": code, "message": message }
        });
        Self::respond_raw(status, body.to_string().into_bytes(), decision)
    }

    fn respond(
        status: u16,
        content_type: String,
        body: Vec<u8>,
        decision: &RateDecision,
        cache_status: &str,
    ) -> GatewayResponse {
        GatewayResponse {
            status,
            content_type,
            body,
            headers: vec![
                (HEADER_CACHE.to_string(), cache_status.to_string()),
                (HEADER_LIMIT.to_string(), decision.limit.to_string()),
                (HEADER_REMAINING.to_string(), decision.remaining.to_string()),
            ],
        }
    }

    fn respond_raw(status: u16, body: Vec<u8>, decision: &RateDecision) -> GatewayResponse {
        GatewayResponse {
            status,
            content_type: "application/json".to_string(),
            body,
            headers: vec![
                (HEADER_LIMIT.to_string(), decision.limit.to_string()),
                (HEADER_REMAINING.to_string(), decision.remaining.to_string()),
            ],
        }
    }
}
