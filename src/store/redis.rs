//! Redis-backed store: a thin adapter over the standard key/value command
//! set (`GET`, `SET .. EX`, `DEL`, `EXISTS`, `INCR`), with native TTL expiry.
//!
//! Eviction policy is the server's business; this adapter adds nothing
//! beyond per-operation timeouts and typed unavailability errors.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;

use super::Store;
use crate::{Error, ErrorContext, Result};

const BACKEND: &str = "redis";

pub struct RedisStore {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisStore {
    /// Open a client for `url`. The connection itself is established lazily
    /// per operation through the multiplexed pool.
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid redis connection string: {}", e),
                ErrorContext::new()
                    .with_field_path("redis_url")
                    .with_source("redis_store"),
            )
        })?;
        Ok(Self { client, op_timeout })
    }

    /// Run one command future under the operation timeout. A timeout or any
    /// connection/protocol error surfaces as `BackendUnavailable`, never
    /// silently, and never left pending.
    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::backend_unavailable(BACKEND, e.to_string())),
            Err(_) => Err(Error::backend_unavailable(
                BACKEND,
                format!("operation exceeded {}ms", self.op_timeout.as_millis()),
            )),
        }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        // EX takes whole seconds; round sub-second TTLs up so they expire,
        // not instantly vanish.
        (ttl.as_millis() as u64).div_ceil(1000)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.run(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.get(key).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            // An already-expired write replaces the value with nothing.
            self.delete(key).await?;
            return Ok(());
        }
        let secs = Self::ttl_secs(ttl);
        self.run(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.set_ex(key, value, secs).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = self
            .run(async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                conn.del(key).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.run(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.exists(key).await
        })
        .await
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<Option<u64>> {
        let secs = Self::ttl_secs(ttl);
        let count = self
            .run(async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                let count: u64 = conn.incr(key, 1u64).await?;
                if count == 1 {
                    let _: bool = conn.expire(key, secs as i64).await?;
                }
                Ok(count)
            })
            .await?;
        Ok(Some(count))
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_connection_string_rejected() {
        let result = RedisStore::new("not a url", Duration::from_millis(250));
        assert!(result.is_err());
    }

    #[test]
    fn test_ttl_rounds_subsecond_up() {
        assert_eq!(RedisStore::ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(RedisStore::ttl_secs(Duration::from_millis(1000)), 1);
        assert_eq!(RedisStore::ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(RedisStore::ttl_secs(Duration::from_secs(60)), 60);
    }
}
