//! 存储抽象模块：缓存与限流共用的键值后端（内存、Redis、降级组合）。
//!
//! # Store Abstraction Module
//!
//! A key/value abstraction shared by the cache layer and the rate limiter.
//! All operations are independently atomic per key; no multi-key
//! transactions are assumed anywhere in the gateway.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Store`] | Trait for key/value backends (`get`/`set`/`delete`/`exists`) |
//! | [`MemoryStore`] | In-process backend with combined TTL + LRU eviction |
//! | [`RedisStore`] | Network backend with native TTL and per-op timeouts |
//! | [`FallbackStore`] | Prefers Redis, degrades to memory behind a circuit breaker |
//! | [`StoreHealth`] | Fallback circuit snapshot for observability |

mod fallback;
mod memory;
mod redis;

pub use fallback::{FallbackStore, StoreHealth};
pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// A key/value backend.
///
/// Writes fully replace existing values (no partial merge). A zero TTL
/// means the value is already expired: the write is a delete.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Returns true when a value was present and removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomic increment-with-TTL, when the backend supports it.
    ///
    /// Returns `Some(new_count)` from backends with an atomic increment;
    /// `None` means unsupported and the caller must fall back to
    /// read-modify-write (accepting the race margin documented on the
    /// rate limiter). The TTL is applied when the counter is created and
    /// left untouched on subsequent increments.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<Option<u64>> {
        let _ = (key, ttl);
        Ok(None)
    }

    fn name(&self) -> &'static str;
}
