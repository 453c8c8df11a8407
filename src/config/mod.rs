pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ClusterConfig {
    /// Load configuration from a file (if it exists), falling back to
    /// built-in defaults when it does not — the node must still be able to
    /// start with `node_id`/`role` supplied purely via env vars for
    /// containerized deployment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ClusterConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, falling back to env vars",
                path.display()
            );
            ClusterConfig::from_env()?
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(node_id = %config.node_id, role = %config.role, "loaded cluster configuration");
        Ok(config)
    }

    fn from_env() -> Result<Self> {
        let node_id =
            std::env::var("MESH_NODE_ID").map_err(|_| anyhow::anyhow!("MESH_NODE_ID not set"))?;
        let role = match std::env::var("MESH_ROLE").as_deref() {
            Ok("coordinator") => NodeRole::Coordinator,
            Ok("worker") => NodeRole::Worker,
            _ => anyhow::bail!("MESH_ROLE must be \"coordinator\" or \"worker\""),
        };
        Ok(ClusterConfig {
            node_id,
            role,
            bind_address: default_bind_address_env(),
            listen_port: 9443,
            bootstrap_coordinators: Vec::new(),
            gossip: GossipConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cert: CertConfig::default(),
            outbound_request_deadline_seconds: 10,
            shutdown_grace_seconds: 5,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_listen_address: None,
            secure_store_dir: "./data/secure-store".to_string(),
            auth_bearer_token: std::env::var("MESH_AUTH_BEARER_TOKEN").ok(),
        })
    }

    /// Env var overrides applied on top of whatever the file (or defaults)
    /// produced — mirrors the teacher's `apply_env_overrides` for
    /// infrastructure settings that operators commonly inject via the
    /// container environment rather than baking into the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESH_BOOTSTRAP_COORDINATORS") {
            self.bootstrap_coordinators = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("MESH_LISTEN_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                self.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("MESH_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("MESH_METRICS_LISTEN_ADDRESS") {
            self.metrics_listen_address = Some(v);
        }
        if let Ok(v) = std::env::var("MESH_AUTH_BEARER_TOKEN") {
            self.auth_bearer_token = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.role == NodeRole::Worker && self.bootstrap_coordinators.is_empty() {
            anyhow::bail!("bootstrap_coordinators is required for workers");
        }
        if self.gossip.interval_min_seconds == 0
            || self.gossip.interval_min_seconds > self.gossip.interval_max_seconds
        {
            anyhow::bail!("gossip interval_min_seconds must be > 0 and <= interval_max_seconds");
        }
        Ok(())
    }
}

fn default_bind_address_env() -> String {
    std::env::var("MESH_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string())
}
