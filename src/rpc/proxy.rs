//! ServiceProxy — typed `Service`/`Target`/`Call` builder (SPEC_FULL §4.3,
//! §9 re-architecture guidance: "the fluent proxy... re-architect as a
//! builder... Sugar layers may still expose a fluent form where idiomatic").
//!
//! `proxy.service("echo").resolve("w1").call("say", params)` mirrors the
//! original `proxy.echo.w1.say(**params)` chain: `resolve` classifies its
//! argument as a role, then a node_id, then falls through to a local call —
//! exactly the three-way classification spec.md §4.3 step 3 describes.

use crate::config::NodeRole;
use crate::directory::NodeDirectory;
use crate::error::{ClusterError, Result};
use crate::pool::ConnectionPool;
use crate::rpc::envelope::{RpcRequest, RpcResponse};
use crate::rpc::registry::MethodRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ServiceProxy {
    directory: NodeDirectory,
    registry: Arc<MethodRegistry>,
    pool: Arc<ConnectionPool>,
    request_deadline: Duration,
}

impl ServiceProxy {
    pub fn new(
        directory: NodeDirectory,
        registry: Arc<MethodRegistry>,
        pool: Arc<ConnectionPool>,
        request_deadline: Duration,
    ) -> Self {
        Self {
            directory,
            registry,
            pool,
            request_deadline,
        }
    }

    pub fn service(&self, name: impl Into<String>) -> Service {
        Service {
            proxy: self.clone(),
            name: name.into(),
        }
    }
}

pub struct Service {
    proxy: ServiceProxy,
    name: String,
}

impl Service {
    /// Bind to an exact node_id.
    pub fn node(&self, node_id: impl Into<String>) -> Target {
        Target {
            proxy: self.proxy.clone(),
            service: self.name.clone(),
            node_id: Some(node_id.into()),
        }
    }

    /// Bind to the reserved role names `coordinator`/`worker`, resolved to
    /// the lowest alive node_id of that role (deterministic tie-break per
    /// spec.md §4.3).
    pub fn role(&self, role: NodeRole) -> Result<Target> {
        let mut candidates = self.proxy.directory.lookup_by_role(role);
        candidates.sort();
        let node_id = candidates
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::UnknownTarget(format!("no alive node with role {role}")))?;
        Ok(Target {
            proxy: self.proxy.clone(),
            service: self.name.clone(),
            node_id: Some(node_id),
        })
    }

    /// Classify `attr` per spec.md §4.3 step 3: reserved role name, then
    /// known node_id, then fall through to treating it as unbound (caller
    /// then issues `call` directly on the returned target, which is LOCAL).
    pub fn resolve(&self, attr: &str) -> Result<Target> {
        match attr {
            "coordinator" => self.role(NodeRole::Coordinator),
            "worker" => self.role(NodeRole::Worker),
            _ if self.proxy.directory.lookup(attr).is_some() => Ok(self.node(attr)),
            _ => Err(ClusterError::InvalidProxyPath(format!(
                "'{attr}' is neither a role nor a known node_id"
            ))),
        }
    }

    /// LOCAL call: look up "{service}/{method}" in the registry and execute
    /// under the caller's task.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let key = format!("{}/{}", self.name, method);
        self.proxy.registry.execute(&key, params).await
    }
}

pub struct Target {
    proxy: ServiceProxy,
    service: String,
    node_id: Option<String>,
}

impl Target {
    /// REMOTE call: resolve the target's current address/port, obtain a
    /// pooled mTLS client, POST a JSON-RPC envelope to /rpc.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let node_id = self
            .node_id
            .as_ref()
            .ok_or_else(|| ClusterError::InvalidProxyPath("target not bound".to_string()))?;

        let info = self
            .proxy
            .directory
            .lookup(node_id)
            .filter(|i| i.status != crate::directory::Status::Dead)
            .ok_or_else(|| ClusterError::UnknownTarget(node_id.clone()))?;

        let method_path = format!("{}/{}", self.service, method);
        let request = RpcRequest::new(method_path, params);

        let body = self
            .proxy
            .pool
            .post_json(
                node_id,
                &info.address,
                info.port,
                "/rpc",
                &request,
                self.proxy.request_deadline,
            )
            .await?;

        let response: RpcResponse = serde_json::from_slice(&body)
            .map_err(|e| ClusterError::TransportError(format!("malformed rpc response: {e}")))?;

        if let Some(err) = response.error {
            return Err(ClusterError::RemoteError {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| ClusterError::TransportError("rpc response missing result".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::NodeInfo;
    use crate::pool::ConnectionPool;
    use std::time::Duration;

    fn directory() -> NodeDirectory {
        let self_info =
            NodeInfo::new_self("c1".into(), "10.0.0.1".into(), 9443, NodeRole::Coordinator);
        NodeDirectory::new(
            self_info,
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_secs(600),
        )
    }

    fn proxy() -> ServiceProxy {
        ServiceProxy::new(
            directory(),
            Arc::new(MethodRegistry::new()),
            Arc::new(ConnectionPool::new_unverified(8, 4)),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn local_call_returns_method_not_found_on_empty_registry() {
        let p = proxy();
        let err = p
            .service("system")
            .call("ping", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MethodNotFound(_)));
    }

    #[test]
    fn resolve_rejects_unknown_attribute() {
        let p = proxy();
        let err = p.service("echo").resolve("nope").unwrap_err();
        assert!(matches!(err, ClusterError::InvalidProxyPath(_)));
    }

    #[test]
    fn role_resolution_fails_without_alive_node() {
        let p = proxy();
        let err = p.service("ops").role(NodeRole::Worker).unwrap_err();
        assert!(matches!(err, ClusterError::UnknownTarget(_)));
    }
}
