//! Pipeline behavior while the distributed backend is unhealthy: requests
//! keep succeeding from the in-memory tier and the circuit keeps the dead
//! backend out of the hot path.

use async_trait::async_trait;
use epoch_gateway::{
    Error, FallbackStore, Gateway, GatewayConfig, GatewayRequest, Handler, HandlerResponse,
    MemoryStore, Result, Store,
};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Distributed-backend stand-in that is permanently unreachable.
struct DownStore {
    calls: AtomicUsize,
}

impl DownStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> Error {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Error::backend_unavailable("redis", "connection refused")
    }
}

#[async_trait]
impl Store for DownStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(self.fail())
    }
    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Err(self.fail())
    }
    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(self.fail())
    }
    async fn exists(&self, _key: &str) -> Result<bool> {
        Err(self.fail())
    }
    async fn incr(&self, _key: &str, _ttl: Duration) -> Result<Option<u64>> {
        Err(self.fail())
    }
    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Install a subscriber so failing tests carry the circuit's warnings.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn call(&self, _request: &GatewayRequest) -> Result<HandlerResponse> {
        Ok(HandlerResponse::json(200, r#"{"ok":true}"#))
    }
}

#[tokio::test]
async fn test_requests_survive_distributed_outage() {
    init_tracing();
    let primary = DownStore::new();
    let fallback = FallbackStore::new(
        Arc::clone(&primary) as Arc<dyn Store>,
        Arc::new(MemoryStore::new(NonZeroUsize::new(128).unwrap())),
        3,
        Duration::from_secs(30),
    );
    let fallback = Arc::new(fallback);
    let gateway = Gateway::with_store(
        GatewayConfig::default(),
        Arc::clone(&fallback) as Arc<dyn Store>,
        Arc::new(EchoHandler),
    )
    .unwrap();

    let request = GatewayRequest::new("GET", "/convert")
        .with_param("timestamp", "0")
        .with_remote_addr("1.2.3.4");

    // Every request succeeds; the caller never sees the outage.
    for _ in 0..6 {
        let response = gateway.handle(&request).await;
        assert_eq!(response.status, 200);
    }

    // After the threshold the circuit is open and the dead backend is no
    // longer consulted per request.
    let health = fallback.health();
    assert!(health.open_remaining_ms.is_some());
    assert!(health.consecutive_failures >= 3);
    let calls_when_open = primary.calls();

    for _ in 0..4 {
        assert_eq!(gateway.handle(&request).await.status, 200);
    }
    assert_eq!(primary.calls(), calls_when_open);
}

#[tokio::test]
async fn test_cache_hits_served_from_memory_during_outage() {
    init_tracing();
    let primary = DownStore::new();
    let fallback = Arc::new(FallbackStore::new(
        Arc::clone(&primary) as Arc<dyn Store>,
        Arc::new(MemoryStore::new(NonZeroUsize::new(128).unwrap())),
        1,
        Duration::from_secs(30),
    ));
    let gateway = Gateway::with_store(
        GatewayConfig::default(),
        Arc::clone(&fallback) as Arc<dyn Store>,
        Arc::new(EchoHandler),
    )
    .unwrap();

    let request = GatewayRequest::new("GET", "/convert")
        .with_param("timestamp", "42")
        .with_remote_addr("5.6.7.8");

    assert_eq!(
        gateway.handle(&request).await.header("X-Cache"),
        Some("MISS")
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        gateway.handle(&request).await.header("X-Cache"),
        Some("HIT")
    );
}
