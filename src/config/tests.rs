use super::ClusterConfig;
use std::io::Write;

#[test]
fn test_load_missing_file_falls_back_to_env() {
    std::env::set_var("MESH_NODE_ID", "env-node");
    std::env::set_var("MESH_ROLE", "coordinator");
    let cfg = ClusterConfig::load(std::path::Path::new("/tmp/does-not-exist.toml")).unwrap();
    assert_eq!(cfg.node_id, "env-node");
    std::env::remove_var("MESH_NODE_ID");
    std::env::remove_var("MESH_ROLE");
}

#[test]
fn test_load_toml_file() {
    let mut file = tempfile_with_suffix(".toml");
    writeln!(file, "node_id = \"c1\"\nrole = \"coordinator\"").unwrap();
    let cfg = ClusterConfig::load(file.path()).unwrap();
    assert_eq!(cfg.node_id, "c1");
}

#[test]
fn test_validate_rejects_worker_without_bootstrap() {
    let cfg = ClusterConfig {
        node_id: "w1".to_string(),
        role: super::NodeRole::Worker,
        bootstrap_coordinators: Vec::new(),
        ..default_coordinator_config()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_accepts_worker_with_bootstrap() {
    let cfg = ClusterConfig {
        node_id: "w1".to_string(),
        role: super::NodeRole::Worker,
        bootstrap_coordinators: vec!["c1:9443".to_string()],
        ..default_coordinator_config()
    };
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_bad_gossip_interval() {
    let mut cfg = default_coordinator_config();
    cfg.gossip.interval_min_seconds = 40;
    cfg.gossip.interval_max_seconds = 30;
    assert!(cfg.validate().is_err());
}

fn default_coordinator_config() -> ClusterConfig {
    ClusterConfig {
        node_id: "c1".to_string(),
        role: super::NodeRole::Coordinator,
        bind_address: "0.0.0.0".to_string(),
        listen_port: 9443,
        bootstrap_coordinators: Vec::new(),
        gossip: super::GossipConfig::default(),
        rate_limit: super::RateLimitConfig::default(),
        cert: super::CertConfig::default(),
        outbound_request_deadline_seconds: 10,
        shutdown_grace_seconds: 5,
        log_level: "info".to_string(),
        log_format: "pretty".to_string(),
        metrics_listen_address: None,
        secure_store_dir: "./data/secure-store".to_string(),
        auth_bearer_token: None,
    }
}

fn tempfile_with_suffix(suffix: &str) -> NamedFile {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "clustermesh-test-{}{}",
        uuid::Uuid::new_v4(),
        suffix
    ));
    NamedFile {
        file: std::fs::File::create(&path).unwrap(),
        path,
    }
}

struct NamedFile {
    file: std::fs::File,
    path: std::path::PathBuf,
}

impl NamedFile {
    fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Write for NamedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Drop for NamedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
