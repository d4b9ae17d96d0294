//! Structured gateway events and pluggable sinks.
//!
//! The gateway emits events; the collector is external. The default sink is
//! a no-op, so nothing is recorded unless the application installs a sink.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::Result;

/// Events emitted by the gateway's cache, rate-limit, and store layers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Every cache lookup, hit or miss, with observed lookup latency.
    CacheLookup {
        key: String,
        hit: bool,
        latency_ms: u64,
    },
    /// A fire-and-forget cache write failed and was discarded.
    CacheStoreFailed { key: String },
    /// A rate-limit decision for an identity.
    RateDecision {
        identity: String,
        tier: String,
        allowed: bool,
        remaining: u32,
    },
    /// An operation against the distributed backend failed and was retried
    /// against the in-memory fallback.
    StoreFellBack {
        backend: String,
        consecutive_failures: u32,
    },
    /// Consecutive failures crossed the threshold; the distributed backend
    /// is skipped for the cooldown window.
    CircuitOpened { backend: String, cooldown_ms: u64 },
    /// A probe after cooldown succeeded; normal routing resumed.
    CircuitClosed { backend: String },
}

/// Destination for gateway events (metrics pipeline, log shipper, test buffer).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: GatewayEvent) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Default sink: drops everything.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: GatewayEvent) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: Arc<RwLock<Vec<GatewayEvent>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: max,
        }
    }

    pub fn get_events(&self) -> Vec<GatewayEvent> {
        self.events.read().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: GatewayEvent) -> Result<()> {
        let mut events = self.events.write().unwrap();
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}

/// Sink that logs events through `tracing` at debug level.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: GatewayEvent) -> Result<()> {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::debug!(target: "epoch_gateway::events", %json, "gateway event"),
            Err(_) => tracing::debug!(target: "epoch_gateway::events", ?event, "gateway event"),
        }
        Ok(())
    }
}

static GLOBAL_SINK: once_cell::sync::Lazy<RwLock<Arc<dyn EventSink>>> =
    once_cell::sync::Lazy::new(|| RwLock::new(Arc::new(NoopEventSink)));

/// Returns the globally configured event sink.
pub fn get_event_sink() -> Arc<dyn EventSink> {
    GLOBAL_SINK.read().unwrap().clone()
}

/// Sets the global event sink.
pub fn set_event_sink(sink: Arc<dyn EventSink>) {
    *GLOBAL_SINK.write().unwrap() = sink;
}

/// Emits an event to the global sink. Sink errors are swallowed: event
/// delivery must never affect the request path.
pub async fn emit(event: GatewayEvent) {
    let _ = get_event_sink().emit(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_collects_and_caps() {
        let sink = InMemoryEventSink::new(2);
        for i in 0..3 {
            sink.emit(GatewayEvent::CacheStoreFailed {
                key: format!("k{}", i),
            })
            .await
            .unwrap();
        }
        let events = sink.get_events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            GatewayEvent::CacheStoreFailed { key } => assert_eq!(key, "k1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_serialize_with_type_tag() {
        let event = GatewayEvent::CircuitOpened {
            backend: "redis".to_string(),
            cooldown_ms: 30_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"circuit_opened\""));
        assert!(json.contains("30000"));
    }
}
