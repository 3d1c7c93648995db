//! Adapters bridge machines and their owners to external channels.
//!
//! An [`Adapter`] is a capability triple (`connect`, `send`, `receive`).
//! The trait makes all three mandatory, so an adapter missing one of them
//! does not compile rather than failing at registration.
//!
//! The [`AdapterRegistry`] holds at most one adapter per type name and
//! forwards calls to it. It adds no retry, backoff or timeout of its own:
//! adapter errors reach the caller unchanged.
//!
//! # Example
//!
//! ```ignore
//! let adapters = AdapterRegistry::with_defaults();
//!
//! adapters.connect("http", json!({ "baseUrl": "https://payments.internal" })).await?;
//! let receipt = adapters
//!     .send("http", json!({ "endpoint": "/charges", "body": { "amount": 500 } }))
//!     .await?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EntangleError;
use crate::http_adapter::{HttpAdapter, HttpConfig};
use crate::socket_adapter::SocketAdapter;

/// Type name of the default HTTP adapter.
pub const HTTP_ADAPTER: &str = "http";

/// Type name of the default socket adapter.
pub const SOCKET_ADAPTER: &str = "websocket";

/// A bridge to an external transport.
///
/// Implementations own whatever connection state they need; the methods
/// take `&self` so one adapter can be shared by many callers.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Prepare the adapter with transport-specific configuration.
    async fn connect(&self, config: Value) -> Result<()>;

    /// Send data out and return the transport's response.
    async fn send(&self, data: Value) -> Result<Value>;

    /// Pull the next piece of inbound data.
    async fn receive(&self) -> Result<Value>;
}

/// Adapter type name → adapter.
///
/// Cheap to clone; clones share the same adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<DashMap<String, Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the default `http` and `websocket` adapters.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(HTTP_ADAPTER, HttpAdapter::new());
        registry.register(SOCKET_ADAPTER, SocketAdapter::new());
        registry
    }

    /// Like [`with_defaults`](Self::with_defaults), with the HTTP adapter
    /// built from `config`.
    pub fn with_defaults_from(config: &HttpConfig) -> Result<Self> {
        let registry = Self::new();
        registry.register(HTTP_ADAPTER, HttpAdapter::from_config(config)?);
        registry.register(SOCKET_ADAPTER, SocketAdapter::new());
        Ok(registry)
    }

    /// Register `adapter` under `adapter_type`. The last registration wins.
    pub fn register<A: Adapter>(&self, adapter_type: impl Into<String>, adapter: A) {
        self.register_shared(adapter_type, Arc::new(adapter));
    }

    /// Register an adapter that is also held elsewhere.
    pub fn register_shared(&self, adapter_type: impl Into<String>, adapter: Arc<dyn Adapter>) {
        let adapter_type = adapter_type.into();
        if self.adapters.insert(adapter_type.clone(), adapter).is_some() {
            warn!(adapter_type = %adapter_type, "adapter replaced");
        } else {
            debug!(adapter_type = %adapter_type, "adapter registered");
        }
    }

    pub fn unregister(&self, adapter_type: &str) -> bool {
        self.adapters.remove(adapter_type).is_some()
    }

    pub fn get(&self, adapter_type: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(adapter_type).map(|a| a.value().clone())
    }

    pub fn adapter_types(&self) -> BTreeSet<String> {
        self.adapters.iter().map(|a| a.key().clone()).collect()
    }

    /// Connect the adapter registered under `adapter_type`.
    ///
    /// # Errors
    ///
    /// [`EntangleError::AdapterNotFound`] for unknown types; otherwise
    /// whatever the adapter returns.
    pub async fn connect(&self, adapter_type: &str, config: Value) -> Result<()> {
        self.require(adapter_type)?.connect(config).await
    }

    /// Send through the adapter registered under `adapter_type`.
    ///
    /// Unknown types fail before any adapter is touched.
    pub async fn send(&self, adapter_type: &str, data: Value) -> Result<Value> {
        self.require(adapter_type)?.send(data).await
    }

    /// Receive from the adapter registered under `adapter_type`.
    pub async fn receive(&self, adapter_type: &str) -> Result<Value> {
        self.require(adapter_type)?.receive().await
    }

    // The map guard is released before the adapter call is awaited
    fn require(&self, adapter_type: &str) -> Result<Arc<dyn Adapter>> {
        self.get(adapter_type)
            .ok_or_else(|| EntangleError::adapter_not_found(adapter_type).into())
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapter_types", &self.adapter_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and echoes what it is sent.
    #[derive(Default)]
    struct EchoAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Adapter for EchoAdapter {
        async fn connect(&self, _config: Value) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, data: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "echo": data }))
        }

        async fn receive(&self) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("inbound"))
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("gateway refused: {0}")]
    struct GatewayError(u16);

    struct RefusingAdapter;

    #[async_trait]
    impl Adapter for RefusingAdapter {
        async fn connect(&self, _config: Value) -> Result<()> {
            Err(GatewayError(503).into())
        }

        async fn send(&self, _data: Value) -> Result<Value> {
            Err(GatewayError(502).into())
        }

        async fn receive(&self) -> Result<Value> {
            Err(GatewayError(504).into())
        }
    }

    #[tokio::test]
    async fn test_calls_reach_registered_adapter() {
        let registry = AdapterRegistry::new();
        let adapter = Arc::new(EchoAdapter::default());
        registry.register_shared("echo", adapter.clone());

        registry.connect("echo", json!({})).await.unwrap();
        let response = registry.send("echo", json!({ "n": 1 })).await.unwrap();
        let inbound = registry.receive("echo").await.unwrap();

        assert_eq!(response, json!({ "echo": { "n": 1 } }));
        assert_eq!(inbound, json!("inbound"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_adapter_fails_without_calling_anything() {
        let registry = AdapterRegistry::new();
        let adapter = Arc::new(EchoAdapter::default());
        registry.register_shared("echo", adapter.clone());

        assert!(registry.get("smtp").is_none());

        let err = registry.send("smtp", json!({})).await.unwrap_err();
        match err.downcast_ref::<EntangleError>() {
            Some(EntangleError::AdapterNotFound { adapter_type }) => {
                assert_eq!(adapter_type, "smtp")
            }
            other => panic!("Expected AdapterNotFound, got {:?}", other),
        }

        assert!(registry.connect("smtp", json!({})).await.is_err());
        assert!(registry.receive("smtp").await.is_err());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_adapter_errors_propagate_unchanged() {
        let registry = AdapterRegistry::new();
        registry.register("gateway", RefusingAdapter);

        let err = registry.send("gateway", json!({})).await.unwrap_err();
        let gateway = err.downcast_ref::<GatewayError>().unwrap();
        assert_eq!(gateway.0, 502);

        let err = registry.connect("gateway", json!({})).await.unwrap_err();
        assert_eq!(err.downcast_ref::<GatewayError>().unwrap().0, 503);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = AdapterRegistry::new();
        registry.register("x", RefusingAdapter);
        registry.register("x", EchoAdapter::default());

        let response = registry.send("x", json!(7)).await.unwrap();
        assert_eq!(response, json!({ "echo": 7 }));
        assert_eq!(registry.adapter_types().len(), 1);
    }

    #[test]
    fn test_defaults_are_registered() {
        let registry = AdapterRegistry::with_defaults();
        let types: Vec<_> = registry.adapter_types().into_iter().collect();
        assert_eq!(types, vec![HTTP_ADAPTER, SOCKET_ADAPTER]);
    }

    #[test]
    fn test_unregister() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.unregister(SOCKET_ADAPTER));
        assert!(!registry.unregister(SOCKET_ADAPTER));
        assert!(registry.get(SOCKET_ADAPTER).is_none());
    }
}
