use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level process configuration — everything needed to bring up one node
/// (spec §6 "Configuration" key list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: String,

    pub role: NodeRole,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Required on workers: host:port pairs of coordinators to bootstrap from.
    #[serde(default)]
    pub bootstrap_coordinators: Vec<String>,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cert: CertConfig,

    #[serde(default = "default_outbound_deadline")]
    pub outbound_request_deadline_seconds: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// When set, a Prometheus `/metrics` admin endpoint is served here.
    #[serde(default)]
    pub metrics_listen_address: Option<String>,

    /// Root directory backing the file-tree SecureStore implementation.
    #[serde(default = "default_secure_store_dir")]
    pub secure_store_dir: String,

    /// When set, incoming RPC requests must carry this bearer token in
    /// addition to presenting a valid mTLS client certificate. When unset,
    /// the mTLS handshake alone is the authentication factor.
    #[serde(default)]
    pub auth_bearer_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    9443
}

fn default_outbound_deadline() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_secure_store_dir() -> String {
    "./data/secure-store".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    #[serde(default = "default_gossip_min")]
    pub interval_min_seconds: u64,

    #[serde(default = "default_gossip_max")]
    pub interval_max_seconds: u64,

    #[serde(default = "default_gossip_targets")]
    pub max_targets: usize,

    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    #[serde(default = "default_suspect_timeout")]
    pub suspect_timeout_seconds: u64,

    #[serde(default = "default_dead_timeout")]
    pub dead_timeout_seconds: u64,

    #[serde(default = "default_evict_timeout")]
    pub evict_timeout_seconds: u64,

    #[serde(default = "default_digest_cap")]
    pub digest_entry_cap: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_min_seconds: default_gossip_min(),
            interval_max_seconds: default_gossip_max(),
            max_targets: default_gossip_targets(),
            compression_threshold_bytes: default_compression_threshold(),
            suspect_timeout_seconds: default_suspect_timeout(),
            dead_timeout_seconds: default_dead_timeout(),
            evict_timeout_seconds: default_evict_timeout(),
            digest_entry_cap: default_digest_cap(),
        }
    }
}

fn default_gossip_min() -> u64 {
    5
}
fn default_gossip_max() -> u64 {
    30
}
fn default_gossip_targets() -> usize {
    5
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_suspect_timeout() -> u64 {
    30
}
fn default_dead_timeout() -> u64 {
    90
}
fn default_evict_timeout() -> u64 {
    600
}
fn default_digest_cap() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rpc_per_min")]
    pub rpc_per_min: f64,

    #[serde(default = "default_rpc_burst")]
    pub rpc_burst: u64,

    #[serde(default = "default_health_per_min")]
    pub health_per_min: f64,

    #[serde(default = "default_health_burst")]
    pub health_burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_per_min: default_rpc_per_min(),
            rpc_burst: default_rpc_burst(),
            health_per_min: default_health_per_min(),
            health_burst: default_health_burst(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_rpc_per_min() -> f64 {
    100.0
}
fn default_rpc_burst() -> u64 {
    20
}
fn default_health_per_min() -> f64 {
    300.0
}
fn default_health_burst() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertConfig {
    #[serde(default = "default_validator_port")]
    pub validator_http_port: u16,

    #[serde(default = "default_renewal_leadtime")]
    pub renewal_leadtime_days: i64,

    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: i64,

    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: i64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            validator_http_port: default_validator_port(),
            renewal_leadtime_days: default_renewal_leadtime(),
            ca_validity_days: default_ca_validity_days(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

fn default_validator_port() -> u16 {
    8802
}
fn default_renewal_leadtime() -> i64 {
    30
}
fn default_ca_validity_days() -> i64 {
    3650
}
fn default_leaf_validity_days() -> i64 {
    365
}

/// Arbitrary string metadata carried on a `NodeInfo`, and service capability
/// summaries exchanged in the gossip digest.
pub type MetadataMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_minimal() {
        let toml_src = r#"
            node_id = "c1"
            role = "coordinator"
        "#;
        let cfg: ClusterConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.node_id, "c1");
        assert_eq!(cfg.role, NodeRole::Coordinator);
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert_eq!(cfg.listen_port, 9443);
        assert!(cfg.bootstrap_coordinators.is_empty());
        assert_eq!(cfg.gossip.interval_min_seconds, 5);
        assert_eq!(cfg.gossip.interval_max_seconds, 30);
        assert_eq!(cfg.rate_limit.rpc_per_min, 100.0);
        assert_eq!(cfg.cert.validator_http_port, 8802);
    }

    #[test]
    fn test_cluster_config_full() {
        let toml_src = r#"
            node_id = "w1"
            role = "worker"
            bind_address = "10.0.0.5"
            listen_port = 9000
            bootstrap_coordinators = ["c1-host:9443"]
            outbound_request_deadline_seconds = 15
            shutdown_grace_seconds = 10

            [gossip]
            interval_min_seconds = 2
            max_targets = 3

            [rate_limit]
            rpc_per_min = 50.0
            rpc_burst = 5

            [cert]
            validator_http_port = 9000
        "#;
        let cfg: ClusterConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.role, NodeRole::Worker);
        assert_eq!(cfg.bootstrap_coordinators, vec!["c1-host:9443"]);
        assert_eq!(cfg.gossip.interval_min_seconds, 2);
        assert_eq!(cfg.gossip.max_targets, 3);
        assert_eq!(cfg.rate_limit.rpc_per_min, 50.0);
        assert_eq!(cfg.rate_limit.rpc_burst, 5);
        assert_eq!(cfg.cert.validator_http_port, 9000);
        assert_eq!(cfg.outbound_request_deadline_seconds, 15);
        assert_eq!(cfg.shutdown_grace_seconds, 10);
    }

    #[test]
    fn test_role_requires_valid_value() {
        let toml_src = r#"
            node_id = "x"
            role = "leader"
        "#;
        let result: Result<ClusterConfig, _> = toml::from_str(toml_src);
        assert!(result.is_err());
    }
}
