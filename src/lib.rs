//! # epoch-gateway
//!
//! 时间戳转换 API 的请求级缓存与限流网关层。
//!
//! Request-scoped caching and rate-limiting gateway layer that sits in
//! front of the epoch timestamp-conversion API.
//!
//! ## Overview
//!
//! The gateway composes a rate limiter and a response cache over a shared
//! key/value store abstraction, in a fixed order per request: rate check,
//! cache lookup, downstream handler, cache store. The downstream conversion
//! logic, the HTTP framework, and the metrics collector are all external
//! collaborators; this crate owns only the concurrency-sensitive middle.
//!
//! ## Core Properties
//!
//! - **Deterministic keys**: identical logical requests always hit the same
//!   cache entry, regardless of parameter order or value formatting
//! - **Bounded memory**: the in-process store combines TTL with LRU eviction
//! - **Graceful degradation**: the distributed backend sits behind a
//!   failure-threshold/cooldown circuit with an in-memory fallback
//! - **Fail-closed limiting**: unknown tiers and unanswerable stores deny,
//!   never allow
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use epoch_gateway::{Gateway, GatewayConfig, GatewayRequest, Handler, HandlerResponse};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct ConvertHandler;
//!
//! #[async_trait]
//! impl Handler for ConvertHandler {
//!     async fn call(&self, request: &GatewayRequest) -> epoch_gateway::Result<HandlerResponse> {
//!         // ... the actual timestamp conversion ...
//!         Ok(HandlerResponse::json(200, r#"{"iso":"1970-01-01T00:00:00Z"}"#))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> epoch_gateway::Result<()> {
//!     let config = GatewayConfig::from_env();
//!     let gateway = Gateway::new(config, Arc::new(ConvertHandler))?;
//!
//!     let request = GatewayRequest::new("GET", "/convert")
//!         .with_param("timestamp", "0")
//!         .with_remote_addr("1.2.3.4");
//!     let response = gateway.handle(&request).await;
//!     assert_eq!(response.status, 200);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`key`] | Cache-key fingerprinting and rate-limit identity derivation |
//! | [`store`] | Key/value backends: memory (LRU+TTL), redis, fallback circuit |
//! | [`cache`] | Response memoization with route-class TTL policy |
//! | [`ratelimit`] | Fixed-window per-identity counters with tier policies |
//! | [`gateway`] | The composed request pipeline and response envelopes |
//! | [`events`] | Structured events with pluggable sinks |
//! | [`config`] | Typed configuration, validated at startup |

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod key;
pub mod ratelimit;
pub mod store;

// Re-export main types for convenience
pub use cache::{CacheControl, CacheLayer, CacheStats, CachedResponse, RouteClass};
pub use config::GatewayConfig;
pub use error::{Error, ErrorContext};
pub use events::{EventSink, GatewayEvent};
pub use gateway::{Gateway, GatewayRequest, GatewayResponse, Handler, HandlerResponse};
pub use key::{CacheKey, KeyCodec};
pub use ratelimit::{RateDecision, RateLimiter, Tier, TierPolicies, TierPolicy};
pub use store::{FallbackStore, MemoryStore, RedisStore, Store, StoreHealth};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
