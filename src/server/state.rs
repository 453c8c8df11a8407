//! ClusterState — root aggregate wiring every subsystem together (SPEC_FULL
//! §4), plus the `Component` adapters that let `LifecycleOrchestrator` start
//! and stop them in dependency order. Generalizes the teacher's
//! `GatewayState` composition-of-sub-states pattern: one cheaply-cloneable
//! struct holding `Arc`/clone-cheap handles to every piece, built once in
//! `ClusterState::new` and handed to both listeners and the orchestrator.

use crate::cert::{CertAuthority, CertProvisioner};
use crate::config::{ClusterConfig, NodeRole};
use crate::directory::{NodeDirectory, NodeInfo};
use crate::gossip::{Gossip, PooledGossipTransport};
use crate::lifecycle::Component;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::rpc::{MethodRegistry, RpcDispatcher, ServiceProxy};
use crate::secure_store::{spawn_periodic_flush, FileSecureStore, SecureStore};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const POOL_MAX_TOTAL: usize = 256;
const POOL_MAX_IDLE_PER_PEER: usize = 8;

#[derive(Clone)]
pub struct ClusterState {
    pub config: Arc<ClusterConfig>,
    pub directory: NodeDirectory,
    pub registry: Arc<MethodRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub proxy: ServiceProxy,
    pub rate_limiter: Arc<RateLimiter>,
    pub secure_store: Arc<dyn SecureStore>,
    pub ca: Option<Arc<CertAuthority>>,
    pub provisioner: Arc<CertProvisioner>,
    pub gossip: Arc<Gossip>,
    pub dispatcher: Arc<RpcDispatcher>,
    pub metrics: Metrics,
}

impl ClusterState {
    /// `self_address` is the address this node will advertise to peers —
    /// resolved by the caller (bootstrap) via `netselect::select_address`
    /// before this is called, since picking it requires probing the
    /// configured bootstrap coordinators.
    pub fn new(config: ClusterConfig, self_address: String) -> Self {
        let config = Arc::new(config);
        let is_coordinator = config.role == NodeRole::Coordinator;

        let secure_store: Arc<dyn SecureStore> = Arc::new(FileSecureStore::new(
            std::path::PathBuf::from(&config.secure_store_dir),
        ));

        let ca = is_coordinator.then(|| {
            Arc::new(CertAuthority::new(
                secure_store.clone(),
                config.cert.ca_validity_days,
                config.cert.leaf_validity_days,
            ))
        });

        let provisioner = Arc::new(CertProvisioner::new(
            config.node_id.clone(),
            secure_store.clone(),
            is_coordinator,
            ca.clone(),
            config.bootstrap_coordinators.clone(),
            config.cert.validator_http_port,
            config.cert.renewal_leadtime_days,
        ));

        let pool = Arc::new(ConnectionPool::new(POOL_MAX_TOTAL, POOL_MAX_IDLE_PER_PEER));

        let self_info = NodeInfo::new_self(
            config.node_id.clone(),
            self_address,
            config.listen_port,
            config.role,
        );
        let directory = NodeDirectory::new(
            self_info,
            Duration::from_secs(config.gossip.suspect_timeout_seconds),
            Duration::from_secs(config.gossip.dead_timeout_seconds),
            Duration::from_secs(config.gossip.evict_timeout_seconds),
        );

        let registry = Arc::new(MethodRegistry::new());

        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            enabled: config.rate_limit.enabled,
            rpc_per_min: config.rate_limit.rpc_per_min,
            rpc_burst: config.rate_limit.rpc_burst,
            health_per_min: config.rate_limit.health_per_min,
            health_burst: config.rate_limit.health_burst,
        }));

        let outbound_deadline = Duration::from_secs(config.outbound_request_deadline_seconds);

        let gossip_transport = Arc::new(PooledGossipTransport::new(pool.clone(), outbound_deadline));
        let gossip = Arc::new(Gossip::new(
            directory.clone(),
            gossip_transport,
            config.gossip.compression_threshold_bytes,
            config.gossip.interval_min_seconds,
            config.gossip.interval_max_seconds,
            config.gossip.max_targets,
            config.gossip.digest_entry_cap,
        ));

        let dispatcher = Arc::new(RpcDispatcher::new(
            registry.clone(),
            directory.clone(),
            rate_limiter.clone(),
            ca.clone(),
            config.auth_bearer_token.clone(),
            gossip.clone(),
        ));

        let proxy = ServiceProxy::new(
            directory.clone(),
            registry.clone(),
            pool.clone(),
            outbound_deadline,
        );

        let metrics = Metrics::install();

        Self {
            config,
            directory,
            registry,
            pool,
            proxy,
            rate_limiter,
            secure_store,
            ca,
            provisioner,
            gossip,
            dispatcher,
            metrics,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.config.bind_address.parse().unwrap_or_else(|_| {
                "0.0.0.0".parse().expect("literal fallback address is valid")
            }),
            self.config.listen_port,
        )
    }

    pub fn bootstrap_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.config.bind_address.parse().unwrap_or_else(|_| {
                "0.0.0.0".parse().expect("literal fallback address is valid")
            }),
            self.config.cert.validator_http_port,
        )
    }
}

/// Flushes the SecureStore to disk every 60s and once more on shutdown.
pub struct SecureStoreComponent {
    store: Arc<dyn SecureStore>,
    shutdown: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SecureStoreComponent {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            shutdown: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for SecureStoreComponent {
    fn name(&self) -> &str {
        "secure_store"
    }

    async fn start(&self) -> crate::error::Result<()> {
        *self.handle.lock().await = Some(spawn_periodic_flush(
            self.store.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    async fn stop(&self, deadline: Duration) {
        self.shutdown.notify_waiters();
        if let Some(h) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, h).await;
        }
    }
}

/// No background work of its own — the pool is built synchronously in
/// `ClusterState::new` and its TLS material is installed later by
/// `CertProvisionerComponent`. Exists purely so the orchestrator's
/// dependency graph carries an explicit `connection_pool` node matching
/// spec's literal component order (SecureStore -> ConnectionPool ->
/// NodeDirectory -> Gossip -> ...).
pub struct ConnectionPoolComponent;

impl ConnectionPoolComponent {
    pub fn new(_pool: Arc<ConnectionPool>) -> Self {
        Self
    }
}

#[async_trait]
impl Component for ConnectionPoolComponent {
    fn name(&self) -> &str {
        "connection_pool"
    }

    async fn start(&self) -> crate::error::Result<()> {
        Ok(())
    }

    async fn stop(&self, _deadline: Duration) {}
}

/// No background work of its own — mutated by gossip receipt, swept by
/// `GossipComponent`'s owned sweep loop. Exists purely so the orchestrator's
/// dependency graph carries an explicit `node_directory` node matching
/// spec's literal component order.
pub struct NodeDirectoryComponent;

impl NodeDirectoryComponent {
    pub fn new(_directory: NodeDirectory) -> Self {
        Self
    }
}

#[async_trait]
impl Component for NodeDirectoryComponent {
    fn name(&self) -> &str {
        "node_directory"
    }

    async fn start(&self) -> crate::error::Result<()> {
        Ok(())
    }

    async fn stop(&self, _deadline: Duration) {}
}

/// Initializes the coordinator's CA (loading or generating it) on a
/// coordinator node; a no-op on a worker, where `ca` is `None`.
pub struct CaComponent {
    ca: Option<Arc<CertAuthority>>,
}

impl CaComponent {
    pub fn new(ca: Option<Arc<CertAuthority>>) -> Self {
        Self { ca }
    }
}

#[async_trait]
impl Component for CaComponent {
    fn name(&self) -> &str {
        "cert_authority"
    }

    async fn start(&self) -> crate::error::Result<()> {
        if let Some(ca) = &self.ca {
            ca.init().await?;
        }
        Ok(())
    }

    async fn stop(&self, _deadline: Duration) {}
}

/// Runs `CertProvisioner::ensure_provisioned` once to bring the node's leaf
/// cert up to date, installs it into the `ConnectionPool` and `RpcDispatcher`,
/// then spawns a background loop that re-checks on the same cadence as the
/// renewal leadtime to catch expiry without a restart.
pub struct CertProvisionerComponent {
    provisioner: Arc<CertProvisioner>,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<RpcDispatcher>,
    ca: Option<Arc<CertAuthority>>,
    secure_store: Arc<dyn SecureStore>,
    ip_addresses: Vec<String>,
    dns_names: Vec<String>,
    recheck_interval: Duration,
    shutdown: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CertProvisionerComponent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provisioner: Arc<CertProvisioner>,
        pool: Arc<ConnectionPool>,
        dispatcher: Arc<RpcDispatcher>,
        ca: Option<Arc<CertAuthority>>,
        secure_store: Arc<dyn SecureStore>,
        ip_addresses: Vec<String>,
        dns_names: Vec<String>,
        recheck_interval: Duration,
    ) -> Self {
        Self {
            provisioner,
            pool,
            dispatcher,
            ca,
            secure_store,
            ip_addresses,
            dns_names,
            recheck_interval,
            shutdown: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    async fn install_once(&self) -> crate::error::Result<()> {
        let record = self
            .provisioner
            .ensure_provisioned(&self.ip_addresses, &self.dns_names)
            .await?;

        let (ca_pem, ca_fingerprint) = match &self.ca {
            Some(ca) => (
                ca.ca_cert_pem().await.unwrap_or_default(),
                ca.ca_fingerprint().await.unwrap_or_default(),
            ),
            None => {
                let pem = fetch_remote_ca_cert(&self.secure_store).await.unwrap_or_default();
                let fp = crate::cert::fingerprint(&pem);
                (pem, fp)
            }
        };

        self.pool.set_material(crate::pool::TlsMaterial {
            ca_pem: ca_pem.clone(),
            ca_fingerprint,
            leaf_cert_pem: record.cert_bytes.clone(),
            leaf_key_pem: record.key_bytes.clone(),
        });

        let material = crate::pool::TlsMaterial {
            ca_pem,
            ca_fingerprint: String::new(),
            leaf_cert_pem: record.cert_bytes,
            leaf_key_pem: record.key_bytes,
        };
        let server_config = crate::server::tls::build_server_config(&material)?;
        self.dispatcher.set_tls_config(server_config);

        Ok(())
    }
}

/// Workers have no local CA; their installed CA root is whatever the
/// coordinator's bootstrap CA cert fetch obtained (fetched separately, over
/// plain HTTP, before the provisioner component starts). Returns `None` only
/// if that earlier bootstrap step never ran.
async fn fetch_remote_ca_cert(secure_store: &Arc<dyn SecureStore>) -> Option<Vec<u8>> {
    secure_store
        .read("cert", crate::cert::REMOTE_CA_CERT_NAME)
        .await
        .ok()
        .flatten()
}

#[async_trait]
impl Component for CertProvisionerComponent {
    fn name(&self) -> &str {
        "cert_provisioner"
    }

    async fn start(&self) -> crate::error::Result<()> {
        self.install_once().await?;

        let this_shutdown = self.shutdown.clone();
        let provisioner = self.provisioner.clone();
        let pool = self.pool.clone();
        let dispatcher = self.dispatcher.clone();
        let ca = self.ca.clone();
        let ip_addresses = self.ip_addresses.clone();
        let dns_names = self.dns_names.clone();
        let recheck_interval = self.recheck_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(recheck_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let record = match provisioner.ensure_provisioned(&ip_addresses, &dns_names).await {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(error = %e, "cert: background renewal check failed");
                                continue;
                            }
                        };
                        let (ca_pem, ca_fingerprint) = match &ca {
                            Some(ca) => (
                                ca.ca_cert_pem().await.unwrap_or_default(),
                                ca.ca_fingerprint().await.unwrap_or_default(),
                            ),
                            None => (Vec::new(), String::new()),
                        };
                        pool.set_material(crate::pool::TlsMaterial {
                            ca_pem: ca_pem.clone(),
                            ca_fingerprint,
                            leaf_cert_pem: record.cert_bytes.clone(),
                            leaf_key_pem: record.key_bytes.clone(),
                        });
                        let material = crate::pool::TlsMaterial {
                            ca_pem,
                            ca_fingerprint: String::new(),
                            leaf_cert_pem: record.cert_bytes,
                            leaf_key_pem: record.key_bytes,
                        };
                        if let Ok(server_config) = crate::server::tls::build_server_config(&material) {
                            dispatcher.set_tls_config(server_config);
                        }
                        metrics::counter!("cluster_cert_renewals_total").increment(1);
                    }
                    _ = this_shutdown.notified() => return,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self, deadline: Duration) {
        self.provisioner.shutdown_handle().notify_waiters();
        self.shutdown.notify_waiters();
        if let Some(h) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, h).await;
        }
    }
}

/// Freezes the `MethodRegistry` once all registration calls made before
/// startup (by embedders calling `ClusterState::registry.register` prior to
/// `LifecycleOrchestrator::run`) have landed.
pub struct RegistryComponent {
    registry: Arc<MethodRegistry>,
}

impl RegistryComponent {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Component for RegistryComponent {
    fn name(&self) -> &str {
        "method_registry"
    }

    async fn start(&self) -> crate::error::Result<()> {
        self.registry.freeze();
        Ok(())
    }

    async fn stop(&self, _deadline: Duration) {}
}

/// Owns the gossip tick loop.
pub struct GossipComponent {
    gossip: Arc<Gossip>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GossipComponent {
    pub fn new(gossip: Arc<Gossip>) -> Self {
        Self {
            gossip,
            handle: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for GossipComponent {
    fn name(&self) -> &str {
        "gossip"
    }

    async fn start(&self) -> crate::error::Result<()> {
        let gossip = self.gossip.clone();
        *self.handle.lock().await = Some(tokio::spawn(async move {
            gossip.run().await;
        }));
        Ok(())
    }

    async fn stop(&self, deadline: Duration) {
        self.gossip.shutdown_handle().notify_waiters();
        if let Some(h) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, h).await;
        }
    }
}

/// Owns the plain-HTTP `/metrics` + `/health` admin listener. Only started
/// when the node is configured with a `metrics_listen_address`.
pub struct AdminComponent {
    listen: Option<SocketAddr>,
    metrics: Metrics,
    shutdown: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AdminComponent {
    pub fn new(listen: Option<SocketAddr>, metrics: Metrics) -> Self {
        Self {
            listen,
            metrics,
            shutdown: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for AdminComponent {
    fn name(&self) -> &str {
        "admin"
    }

    async fn start(&self) -> crate::error::Result<()> {
        let Some(listen) = self.listen else {
            return Ok(());
        };
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        *self.handle.lock().await = Some(tokio::spawn(async move {
            if let Err(e) = crate::server::admin::serve(listen, metrics, shutdown).await {
                tracing::error!(error = %e, "admin: listener exited");
            }
        }));
        Ok(())
    }

    async fn stop(&self, deadline: Duration) {
        self.shutdown.notify_waiters();
        if let Some(h) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(deadline, h).await;
        }
    }
}

/// Owns the mTLS `/rpc`+`/health`+`/internal/gossip` listener and the
/// plain-HTTP bootstrap listener.
pub struct DispatcherComponent {
    dispatcher: Arc<RpcDispatcher>,
    listen: SocketAddr,
    bootstrap_listen: SocketAddr,
    is_coordinator: bool,
    shutdown: Arc<Notify>,
    handles: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DispatcherComponent {
    pub fn new(
        dispatcher: Arc<RpcDispatcher>,
        listen: SocketAddr,
        bootstrap_listen: SocketAddr,
        is_coordinator: bool,
    ) -> Self {
        Self {
            dispatcher,
            listen,
            bootstrap_listen,
            is_coordinator,
            shutdown: Arc::new(Notify::new()),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Component for DispatcherComponent {
    fn name(&self) -> &str {
        "rpc_dispatcher"
    }

    async fn start(&self) -> crate::error::Result<()> {
        let mut handles = self.handles.lock().await;

        let dispatcher = self.dispatcher.clone();
        let listen = self.listen;
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = dispatcher.serve(listen, shutdown).await {
                tracing::error!(error = %e, "rpc: main listener exited");
            }
        }));

        if self.is_coordinator {
            let dispatcher = self.dispatcher.clone();
            let bootstrap_listen = self.bootstrap_listen;
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = dispatcher.serve_bootstrap(bootstrap_listen, shutdown).await {
                    tracing::error!(error = %e, "rpc: bootstrap listener exited");
                }
            }));
        }

        Ok(())
    }

    async fn stop(&self, deadline: Duration) {
        self.shutdown.notify_waiters();
        let mut handles = self.handles.lock().await;
        for h in handles.drain(..) {
            let _ = tokio::time::timeout(deadline, h).await;
        }
    }
}
