//! MethodRegistry — flat "{service}/{method}" keyspace populated during
//! service init and frozen thereafter (SPEC_FULL §4.3). Built once and
//! swapped via `ArcSwap`, the same lock-free-read pattern the teacher uses
//! for `routing::RouteTable` (`server/state.rs` `RoutingState::route_table`).

use crate::error::{ClusterError, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn call(&self, params: Value) -> Result<Value> {
        (self)(params).await
    }
}

pub struct MethodEntry {
    pub key: String,
    pub public: bool,
    pub description: String,
    pub handler: Arc<dyn Handler>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Arc<MethodEntry>>,
}

/// Append-only post-freeze. Reads are lock-free (`ArcSwap::load`); writes
/// take the registration lock and fail once `freeze()` has been called
/// (V2: "no registration succeeds after LifecycleOrchestrator marks the
/// dispatcher running").
pub struct MethodRegistry {
    table: ArcSwap<Table>,
    write_lock: tokio::sync::Mutex<()>,
    frozen: AtomicBool,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::new(Arc::new(Table::default())),
            write_lock: tokio::sync::Mutex::new(()),
            frozen: AtomicBool::new(false),
        }
    }

    pub async fn register(
        &self,
        service: &str,
        method: &str,
        public: bool,
        description: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(ClusterError::InvariantViolation(format!(
                "registration after freeze: {service}/{method}"
            )));
        }
        let key = format!("{service}/{method}");
        let _guard = self.write_lock.lock().await;
        let current = self.table.load();
        if current.entries.contains_key(&key) {
            return Err(ClusterError::DuplicateMethod(key));
        }
        let mut entries = current.entries.clone();
        entries.insert(
            key.clone(),
            Arc::new(MethodEntry {
                key: key.clone(),
                public,
                description: description.into(),
                handler,
            }),
        );
        self.table.store(Arc::new(Table { entries }));
        Ok(())
    }

    /// Called by LifecycleOrchestrator once the dispatcher is about to start
    /// serving. No registration succeeds afterward.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<MethodEntry>> {
        self.table.load().entries.get(key).cloned()
    }

    pub async fn execute(&self, key: &str, params: Value) -> Result<Value> {
        let entry = self
            .lookup(key)
            .ok_or_else(|| ClusterError::MethodNotFound(key.to_string()))?;
        entry.handler.call(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_handler() -> Arc<dyn Handler> {
        Arc::new(|params: Value| async move { Ok(params) })
    }

    #[tokio::test]
    async fn register_then_execute() {
        let reg = MethodRegistry::new();
        reg.register("system", "ping", true, "ping", ping_handler())
            .await
            .unwrap();
        let result = reg
            .execute("system/ping", serde_json::json!({"pong": "x"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"pong": "x"}));
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let reg = MethodRegistry::new();
        reg.register("system", "ping", true, "", ping_handler())
            .await
            .unwrap();
        let err = reg
            .register("system", "ping", true, "", ping_handler())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateMethod(_)));
    }

    #[tokio::test]
    async fn registration_after_freeze_is_rejected() {
        let reg = MethodRegistry::new();
        reg.freeze();
        let err = reg
            .register("system", "ping", true, "", ping_handler())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn empty_registry_returns_method_not_found() {
        let reg = MethodRegistry::new();
        let err = reg
            .execute("system/ping", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MethodNotFound(_)));
    }
}
