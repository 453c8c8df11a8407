//! End-to-end bring-up of a single coordinator node: CA init, leaf cert
//! issuance, mTLS listener, and a registered RPC method reachable over the
//! real socket. Exercises scenario S1 ("a coordinator starts cold and serves
//! traffic") and S2 ("a registered method answers a local RPC call") without
//! external services, the way the teacher's integration tests exercise a
//! real protocol client against a locally-started dependency.

use clustermesh::config::{CertConfig, ClusterConfig, GossipConfig, NodeRole, RateLimitConfig};
use clustermesh::lifecycle::LifecycleOrchestrator;
use clustermesh::rpc::envelope::{RpcRequest, RpcResponse};
use clustermesh::server::state::{
    CaComponent, ClusterState, DispatcherComponent, RegistryComponent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_config(node_id: &str, listen_port: u16, validator_port: u16, store_dir: std::path::PathBuf) -> ClusterConfig {
    ClusterConfig {
        node_id: node_id.to_string(),
        role: NodeRole::Coordinator,
        bind_address: "127.0.0.1".to_string(),
        listen_port,
        bootstrap_coordinators: Vec::new(),
        gossip: GossipConfig::default(),
        rate_limit: RateLimitConfig::default(),
        cert: CertConfig {
            validator_http_port: validator_port,
            ..CertConfig::default()
        },
        outbound_request_deadline_seconds: 5,
        shutdown_grace_seconds: 2,
        log_level: "info".to_string(),
        log_format: "pretty".to_string(),
        metrics_listen_address: None,
        secure_store_dir: store_dir.to_string_lossy().to_string(),
        auth_bearer_token: None,
    }
}

#[tokio::test]
async fn coordinator_serves_a_registered_method_over_mtls() {
    let dir = std::env::temp_dir().join(format!("clustermesh-test-{}", uuid::Uuid::new_v4()));
    let config = test_config("c1", 19543, 19802, dir.clone());
    let state = ClusterState::new(config, "127.0.0.1".to_string());

    state
        .registry
        .register(
            "echo",
            "say",
            true,
            "echoes params back",
            Arc::new(|params: serde_json::Value| async move { Ok(params) }),
        )
        .await
        .unwrap();

    let mut orchestrator = LifecycleOrchestrator::new(Duration::from_secs(2));
    orchestrator.register(Arc::new(CaComponent::new(state.ca.clone())), &[]);
    orchestrator.register(Arc::new(RegistryComponent::new(state.registry.clone())), &[]);

    // Drive CA init + registry freeze directly rather than spawning the full
    // orchestrator loop, since this test needs the leaf cert material before
    // it can build a client — install it inline instead of through
    // CertProvisionerComponent's backoff loop.
    state.ca.as_ref().unwrap().init().await.unwrap();
    state.registry.freeze();

    let record = state
        .ca
        .as_ref()
        .unwrap()
        .issue_leaf("c1", &["127.0.0.1".to_string()], &[])
        .await
        .unwrap();
    let ca_pem = state.ca.as_ref().unwrap().ca_cert_pem().await.unwrap();

    state.pool.set_material(clustermesh::pool::TlsMaterial {
        ca_pem: ca_pem.clone(),
        ca_fingerprint: state.ca.as_ref().unwrap().ca_fingerprint().await.unwrap(),
        leaf_cert_pem: record.cert_bytes.clone(),
        leaf_key_pem: record.key_bytes.clone(),
    });
    let server_config = clustermesh::server::tls::build_server_config(&clustermesh::pool::TlsMaterial {
        ca_pem,
        ca_fingerprint: String::new(),
        leaf_cert_pem: record.cert_bytes,
        leaf_key_pem: record.key_bytes,
    })
    .unwrap();
    state.dispatcher.set_tls_config(server_config);

    let dispatcher_component = Arc::new(DispatcherComponent::new(
        state.dispatcher.clone(),
        state.listen_addr(),
        state.bootstrap_listen_addr(),
        true,
    ));
    dispatcher_component.start().await.unwrap();

    // Give the listener a moment to bind before the client connects.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let request = RpcRequest::new("echo/say", json!({"msg": "hi"}));
    let raw = state
        .pool
        .post_json(
            "c1",
            "127.0.0.1",
            19543,
            "/rpc",
            &request,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let response: RpcResponse = serde_json::from_slice(&raw).unwrap();

    assert_eq!(response.result.unwrap()["msg"], "hi");
    assert!(response.error.is_none());

    tokio::fs::remove_dir_all(&dir).await.ok();
}
