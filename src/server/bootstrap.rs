//! Node lifecycle: load config → resolve advertised address → (worker-only)
//! fetch the coordinator's CA root over plain HTTP → build `ClusterState` →
//! register every `Component` with the `LifecycleOrchestrator` → run until
//! signalled. The phase-numbered shape and `init_tracing` setup are grounded
//! directly in the teacher's `server::bootstrap::run`.

use crate::lifecycle::LifecycleOrchestrator;
use crate::cert::REMOTE_CA_CERT_NAME;
use crate::server::state::{
    AdminComponent, CaComponent, CertProvisionerComponent, ClusterState, ConnectionPoolComponent,
    DispatcherComponent, GossipComponent, NodeDirectoryComponent, RegistryComponent,
    SecureStoreComponent,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
}

/// Node lifecycle: init → resolve → provision → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config = crate::config::ClusterConfig::load(&args.config_path)
        .context("loading cluster configuration")?;

    init_tracing(&config.log_level, &config.log_format);

    let coordinators = resolve_coordinators(&config.bootstrap_coordinators)?;
    let self_address = crate::netselect::select_address(&coordinators, Duration::from_secs(2))
        .await
        .map(|c| c.address.to_string())
        .unwrap_or_else(|| {
            tracing::warn!("netselect: no usable local interface found, advertising bind_address");
            config.bind_address.clone()
        });
    tracing::info!(node_id = %config.node_id, role = %config.role, address = %self_address, "bootstrap: resolved advertised address");

    let is_worker = config.role == crate::config::NodeRole::Worker;
    if is_worker {
        fetch_remote_ca_into_store(&config).await;
    }

    let state = ClusterState::new(config, self_address);

    let mut orchestrator =
        LifecycleOrchestrator::new(Duration::from_secs(state.config.shutdown_grace_seconds));

    let secure_store_component = std::sync::Arc::new(SecureStoreComponent::new(state.secure_store.clone()));
    let connection_pool_component =
        std::sync::Arc::new(ConnectionPoolComponent::new(state.pool.clone()));
    let node_directory_component =
        std::sync::Arc::new(NodeDirectoryComponent::new(state.directory.clone()));
    let ca_component = std::sync::Arc::new(CaComponent::new(state.ca.clone()));
    let registry_component = std::sync::Arc::new(RegistryComponent::new(state.registry.clone()));
    let gossip_component = std::sync::Arc::new(GossipComponent::new(state.gossip.clone()));

    let san_ip = state.directory.self_info().address;
    let cert_provisioner_component = std::sync::Arc::new(CertProvisionerComponent::new(
        state.provisioner.clone(),
        state.pool.clone(),
        state.dispatcher.clone(),
        state.ca.clone(),
        state.secure_store.clone(),
        vec![san_ip],
        vec![state.config.node_id.clone()],
        renewal_recheck_interval(state.config.cert.renewal_leadtime_days),
    ));

    let is_coordinator = state.config.role == crate::config::NodeRole::Coordinator;
    let dispatcher_component = std::sync::Arc::new(DispatcherComponent::new(
        state.dispatcher.clone(),
        state.listen_addr(),
        state.bootstrap_listen_addr(),
        is_coordinator,
    ));

    // Dependency order mirrors the documented component order: SecureStore ->
    // ConnectionPool -> NodeDirectory -> Gossip -> CertAuthority/Provisioner ->
    // MethodRegistry -> RpcDispatcher.
    orchestrator.register(secure_store_component, &[]);
    orchestrator.register(connection_pool_component, &["secure_store"]);
    orchestrator.register(node_directory_component, &["connection_pool"]);
    orchestrator.register(gossip_component, &["node_directory"]);
    orchestrator.register(ca_component, &["gossip"]);
    orchestrator.register(
        cert_provisioner_component,
        &["secure_store", "cert_authority"],
    );
    orchestrator.register(registry_component, &["cert_provisioner"]);
    orchestrator.register(
        dispatcher_component,
        &["method_registry", "cert_provisioner"],
    );

    let admin_listen = state
        .config
        .metrics_listen_address
        .as_ref()
        .and_then(|addr| addr.parse::<SocketAddr>().ok());
    let admin_component = std::sync::Arc::new(AdminComponent::new(admin_listen, state.metrics.clone()));
    orchestrator.register(admin_component, &[]);

    tracing::info!(
        node_id = %state.config.node_id,
        listen = %state.listen_addr(),
        "server: starting node"
    );

    orchestrator.run().await?;

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// Turns the `host:port` strings a worker is configured with into resolved
/// `SocketAddr`s for `netselect::select_address` to probe. Unresolvable
/// entries are logged and skipped rather than failing startup — the node can
/// still come up and retry cert provisioning later.
fn resolve_coordinators(raw: &[String]) -> Result<Vec<SocketAddr>> {
    let mut resolved = Vec::new();
    for entry in raw {
        match std::net::ToSocketAddrs::to_socket_addrs(entry) {
            Ok(addrs) => resolved.extend(addrs),
            Err(e) => tracing::warn!(entry = %entry, error = %e, "bootstrap: coordinator address did not resolve"),
        }
    }
    Ok(resolved)
}

/// Workers have no local `CertAuthority`; this fetches the coordinator's CA
/// root over plain HTTP (the companion bootstrap listener's
/// `GET /internal/ca-cert`, unauthenticated by design — the leaf cert request
/// that follows is what's actually gated) and persists it so
/// `CertProvisionerComponent::fetch_remote_ca_cert` can read it back without
/// a network round trip on every renewal check.
async fn fetch_remote_ca_into_store(config: &crate::config::ClusterConfig) {
    let Some(first) = config.bootstrap_coordinators.first() else {
        return;
    };
    let host = first.split(':').next().unwrap_or(first);
    let url = format!("http://{host}:{}/internal/ca-cert", config.cert.validator_http_port);

    let client = reqwest::Client::new();
    let fetch = client.get(&url).timeout(Duration::from_secs(10)).send().await;
    let pem = match fetch {
        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, "bootstrap: reading CA cert response body failed");
                return;
            }
        },
        Ok(resp) => {
            tracing::warn!(status = %resp.status(), "bootstrap: CA cert fetch returned non-success");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, url = %url, "bootstrap: CA cert fetch failed, provisioning will retry later");
            return;
        }
    };

    let store = crate::secure_store::FileSecureStore::new(std::path::PathBuf::from(
        &config.secure_store_dir,
    ));
    if let Err(e) = crate::secure_store::SecureStore::write(&store, "cert", REMOTE_CA_CERT_NAME, pem).await {
        tracing::warn!(error = %e, "bootstrap: persisting fetched CA cert failed");
    }
}

/// Re-checks cert validity at roughly a third of the renewal leadtime, so a
/// missed check still leaves margin before the leaf actually expires.
fn renewal_recheck_interval(renewal_leadtime_days: i64) -> Duration {
    let days = (renewal_leadtime_days / 3).max(1) as u64;
    Duration::from_secs(days * 86_400)
}

fn init_tracing(log_level: &str, log_format: &str) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(false),
            )
            .init();
    }

    std::mem::forget(guard);
}
