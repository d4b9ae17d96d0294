//! Fallback composition: prefer the distributed backend, degrade to memory.
//!
//! Health bookkeeping is plain atomics, deliberately not the memory store's
//! mutex, so unrelated operations never serialize behind it. Writes made
//! while degraded are not backfilled when the primary recovers; stale
//! distributed entries age out through their own TTL.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::Store;
use crate::events::{self, GatewayEvent};
use crate::Result;

/// Circuit snapshot for the fallback store.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub backend_name: String,
    pub consecutive_failures: u32,
    /// Wall-clock time of the last primary failure, if any.
    pub last_failure_unix_ms: Option<u64>,
    /// Remaining cooldown in ms, if the circuit is currently open.
    pub open_remaining_ms: Option<u64>,
}

pub struct FallbackStore {
    primary: Arc<dyn Store>,
    fallback: Arc<dyn Store>,
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    /// Monotonic ms (relative to `started`) until which the primary is
    /// skipped; 0 means the circuit is closed.
    open_until_ms: AtomicU64,
    last_failure_unix_ms: AtomicU64,
    started: Instant,
}

impl FallbackStore {
    pub fn new(
        primary: Arc<dyn Store>,
        fallback: Arc<dyn Store>,
        threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            last_failure_unix_ms: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// True when the primary should be attempted. Once the cooldown has
    /// elapsed exactly one operation wins the probe; the rest stay on the
    /// fallback until the probe's outcome closes or re-arms the circuit.
    fn primary_allowed(&self) -> bool {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        if open_until == 0 {
            return true;
        }
        let now = self.now_ms();
        if now < open_until {
            return false;
        }
        // Push the deadline out before probing so a concurrent burst does
        // not pile onto a backend that may still be down.
        self.open_until_ms
            .compare_exchange(
                open_until,
                now + self.cooldown.as_millis() as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    async fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_failure_unix_ms.store(unix_ms, Ordering::Release);
        tracing::warn!(
            backend = self.primary.name(),
            consecutive_failures = failures,
            "store backend unavailable, serving from fallback"
        );
        events::emit(GatewayEvent::StoreFellBack {
            backend: self.primary.name().to_string(),
            consecutive_failures: failures,
        })
        .await;
        if failures >= self.threshold {
            self.open_until_ms.store(
                self.now_ms() + self.cooldown.as_millis() as u64,
                Ordering::Release,
            );
            events::emit(GatewayEvent::CircuitOpened {
                backend: self.primary.name().to_string(),
                cooldown_ms: self.cooldown.as_millis() as u64,
            })
            .await;
        }
    }

    async fn on_success(&self) {
        let had_failures = self.consecutive_failures.swap(0, Ordering::AcqRel) > 0;
        let was_open = self.open_until_ms.swap(0, Ordering::AcqRel) > 0;
        if was_open || had_failures {
            events::emit(GatewayEvent::CircuitClosed {
                backend: self.primary.name().to_string(),
            })
            .await;
        }
    }

    pub fn health(&self) -> StoreHealth {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        let now = self.now_ms();
        let last_failure = self.last_failure_unix_ms.load(Ordering::Acquire);
        StoreHealth {
            backend_name: self.primary.name().to_string(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            last_failure_unix_ms: (last_failure > 0).then_some(last_failure),
            open_remaining_ms: (open_until > now).then(|| open_until - now),
        }
    }
}

#[async_trait]
impl Store for FallbackStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.primary_allowed() {
            match self.primary.get(key).await {
                Ok(value) => {
                    self.on_success().await;
                    return Ok(value);
                }
                Err(e) if e.is_backend_unavailable() => self.on_failure().await,
                Err(e) => return Err(e),
            }
        }
        self.fallback.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        if self.primary_allowed() {
            match self.primary.set(key, value, ttl).await {
                Ok(()) => {
                    self.on_success().await;
                    return Ok(());
                }
                Err(e) if e.is_backend_unavailable() => self.on_failure().await,
                Err(e) => return Err(e),
            }
        }
        self.fallback.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if self.primary_allowed() {
            match self.primary.delete(key).await {
                Ok(removed) => {
                    self.on_success().await;
                    // Remove any shadow copy written while degraded.
                    let _ = self.fallback.delete(key).await;
                    return Ok(removed);
                }
                Err(e) if e.is_backend_unavailable() => self.on_failure().await,
                Err(e) => return Err(e),
            }
        }
        self.fallback.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.primary_allowed() {
            match self.primary.exists(key).await {
                Ok(found) => {
                    self.on_success().await;
                    return Ok(found);
                }
                Err(e) if e.is_backend_unavailable() => self.on_failure().await,
                Err(e) => return Err(e),
            }
        }
        self.fallback.exists(key).await
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<Option<u64>> {
        if self.primary_allowed() {
            match self.primary.incr(key, ttl).await {
                Ok(count) => {
                    self.on_success().await;
                    return Ok(count);
                }
                Err(e) if e.is_backend_unavailable() => self.on_failure().await,
                Err(e) => return Err(e),
            }
        }
        self.fallback.incr(key, ttl).await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::Error;
    use std::num::NonZeroUsize;
    use std::sync::atomic::AtomicUsize;

    /// Primary stub that fails the first `fail_first` calls, then succeeds.
    struct FlakyStore {
        calls: AtomicUsize,
        fail_first: usize,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn failing_forever() -> Self {
            Self::new(usize::MAX)
        }

        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                inner: MemoryStore::new(NonZeroUsize::new(64).unwrap()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::backend_unavailable("stub", "induced failure"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            self.check()?;
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.check()?;
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.check()?;
            self.inner.exists(key).await
        }
        async fn incr(&self, key: &str, ttl: Duration) -> Result<Option<u64>> {
            self.check()?;
            self.inner.incr(key, ttl).await
        }
        fn name(&self) -> &'static str {
            "stub"
        }
    }

    fn memory() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new(NonZeroUsize::new(64).unwrap()))
    }

    #[tokio::test]
    async fn test_operations_succeed_while_primary_down() {
        let primary = Arc::new(FlakyStore::failing_forever());
        let fb = FallbackStore::new(primary, memory(), 5, Duration::from_secs(30));
        let ttl = Duration::from_secs(60);

        fb.set("k", b"v", ttl).await.unwrap();
        assert_eq!(fb.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(fb.exists("k").await.unwrap());
        assert!(fb.delete("k").await.unwrap());
        assert_eq!(fb.incr("c", ttl).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let primary = Arc::new(FlakyStore::failing_forever());
        let fb = FallbackStore::new(
            Arc::clone(&primary) as Arc<dyn Store>,
            memory(),
            3,
            Duration::from_secs(30),
        );

        for _ in 0..3 {
            fb.get("k").await.unwrap();
        }
        assert_eq!(primary.calls(), 3);
        assert!(fb.health().open_remaining_ms.is_some());

        // Circuit open: no further calls reach the primary.
        for _ in 0..5 {
            fb.get("k").await.unwrap();
        }
        assert_eq!(primary.calls(), 3);
        assert_eq!(fb.health().consecutive_failures, 3);
        assert!(fb.health().last_failure_unix_ms.is_some());
    }

    #[tokio::test]
    async fn test_probe_after_cooldown_resets_on_success() {
        // Fails the first 2 calls (enough to open), succeeds afterwards.
        let primary = Arc::new(FlakyStore::new(2));
        let fb = FallbackStore::new(
            Arc::clone(&primary) as Arc<dyn Store>,
            memory(),
            2,
            Duration::from_millis(40),
        );

        fb.get("k").await.unwrap();
        fb.get("k").await.unwrap();
        assert_eq!(primary.calls(), 2);
        assert!(fb.health().open_remaining_ms.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Next operation probes the primary and closes the circuit.
        fb.get("k").await.unwrap();
        assert_eq!(primary.calls(), 3);
        let health = fb.health();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.open_remaining_ms.is_none());

        // Routing is back to normal.
        fb.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(primary.calls(), 4);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_circuit() {
        let primary = Arc::new(FlakyStore::failing_forever());
        let fb = FallbackStore::new(
            Arc::clone(&primary) as Arc<dyn Store>,
            memory(),
            2,
            Duration::from_millis(30),
        );

        fb.get("k").await.unwrap();
        fb.get("k").await.unwrap();
        assert_eq!(primary.calls(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        fb.get("k").await.unwrap(); // probe fails
        assert_eq!(primary.calls(), 3);
        assert!(fb.health().open_remaining_ms.is_some());

        // Open again: still no traffic to the primary.
        fb.get("k").await.unwrap();
        assert_eq!(primary.calls(), 3);
    }

    /// Unreachable primary whose failures take a while, like a timing-out
    /// network call.
    struct SlowDeadStore {
        calls: AtomicUsize,
    }

    impl SlowDeadStore {
        async fn fail(&self) -> Error {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Error::backend_unavailable("stub", "timed out")
        }
    }

    #[async_trait]
    impl Store for SlowDeadStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(self.fail().await)
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
            Err(self.fail().await)
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(self.fail().await)
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(self.fail().await)
        }
        fn name(&self) -> &'static str {
            "stub"
        }
    }

    #[tokio::test]
    async fn test_concurrent_burst_elects_single_probe() {
        let primary = Arc::new(SlowDeadStore {
            calls: AtomicUsize::new(0),
        });
        let fb = FallbackStore::new(
            Arc::clone(&primary) as Arc<dyn Store>,
            memory(),
            1,
            Duration::from_millis(20),
        );

        // Open the circuit.
        fb.get("k").await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Cooldown elapsed: of four concurrent operations only one probes
        // the primary, the rest are served by the fallback immediately.
        let (a, b, c, d) = tokio::join!(fb.get("k"), fb.get("k"), fb.get("k"), fb.get("k"));
        a.unwrap();
        b.unwrap();
        c.unwrap();
        d.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_degraded_writes_not_backfilled() {
        let primary = Arc::new(FlakyStore::new(2));
        let fb = FallbackStore::new(
            Arc::clone(&primary) as Arc<dyn Store>,
            memory(),
            2,
            Duration::from_millis(30),
        );

        // Open the circuit, then write while degraded.
        fb.get("k").await.unwrap();
        fb.get("k").await.unwrap();
        fb.set("k", b"degraded", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Primary recovered but never saw the degraded write.
        assert_eq!(fb.get("k").await.unwrap(), None);
    }
}
