//! CertProvisioner — the per-node state machine of SPEC_FULL §4.6:
//! `CHECK -> SPIN_UP_HTTP_VALIDATOR -> REQUEST_CERT -> INSTALL -> RUN`, with
//! exponential backoff on failure. The requester's `REQUEST_CERT` step is a
//! single blocking HTTP call whose response only arrives once the
//! coordinator has synchronously completed its own `AWAIT_CALLBACK` fetch —
//! so from the requester's side there is no separate wait state.
//!
//! On a coordinator node the CA is local, so `REQUEST_CERT` short-circuits to
//! a direct `CertAuthority::issue_leaf` call instead of a network round trip.

use crate::cert::authority::{fingerprint, CertAuthority, CertificateRecord, PendingChallenge};
use crate::error::{ClusterError, Result};
use crate::secure_store::SecureStore;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};

const RENEWAL_LEADTIME_SECS: u64 = 30 * 86_400;
const CERT_NAMESPACE: &str = "cert";
const LEAF_RECORD_NAME: &str = "leaf-cert.json";

/// Name the worker bootstrap path (`server::bootstrap::run`) writes the
/// coordinator's CA cert PEM under after fetching it from
/// `/internal/ca-cert`, before this provisioner's first CHECK ever runs.
/// Workers have no local `CertAuthority`, so this is their only source of
/// the CA root they trust.
pub const REMOTE_CA_CERT_NAME: &str = "remote-ca-cert.pem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerState {
    Check,
    SpinUpValidator,
    RequestCert,
    Install,
    Run,
    Backoff,
}

#[derive(Serialize, Deserialize)]
struct CertRequestBody {
    node_id: String,
    challenge: String,
    ip_addresses: Vec<String>,
    dns_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_cert_fingerprint: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CertRequestResponse {
    certificate: String,
    private_key: String,
    node_id: String,
    valid_days: i64,
}

#[derive(Serialize, Deserialize)]
struct ChallengeResponse {
    challenge: String,
    node_id: String,
    timestamp: u64,
}

pub struct CertProvisioner {
    node_id: String,
    store: Arc<dyn SecureStore>,
    is_coordinator: bool,
    ca: Option<Arc<CertAuthority>>,
    bootstrap_coordinators: Vec<String>,
    validator_port: u16,
    renewal_leadtime_secs: u64,
    state: Mutex<ProvisionerState>,
    shutdown: Arc<Notify>,
}

impl CertProvisioner {
    pub fn new(
        node_id: String,
        store: Arc<dyn SecureStore>,
        is_coordinator: bool,
        ca: Option<Arc<CertAuthority>>,
        bootstrap_coordinators: Vec<String>,
        validator_port: u16,
        renewal_leadtime_days: i64,
    ) -> Self {
        Self {
            node_id,
            store,
            is_coordinator,
            ca,
            bootstrap_coordinators,
            validator_port,
            renewal_leadtime_secs: renewal_leadtime_days as u64 * 86_400,
            state: Mutex::new(ProvisionerState::Check),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn state(&self) -> ProvisionerState {
        *self.state.lock().await
    }

    async fn set_state(&self, s: ProvisionerState) {
        *self.state.lock().await = s;
    }

    /// The fingerprint of the CA this node currently trusts: the local CA's
    /// own fingerprint on a coordinator, or the fingerprint of whatever CA
    /// cert `bootstrap::fetch_remote_ca_into_store` last persisted on a
    /// worker. `None` only if neither source is available yet.
    async fn trusted_ca_fingerprint(&self) -> Option<String> {
        if let Some(ca) = &self.ca {
            return ca.ca_fingerprint().await;
        }
        let pem = self
            .store
            .read(CERT_NAMESPACE, REMOTE_CA_CERT_NAME)
            .await
            .ok()
            .flatten()?;
        Some(fingerprint(&pem))
    }

    /// Runs CHECK once and, if renewal is needed, drives the full flow
    /// through INSTALL, retrying with exponential backoff (1/2/4/8s, capped
    /// 60s) until it succeeds or shutdown fires. Blocks until RUN is reached.
    pub async fn ensure_provisioned(
        &self,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<CertificateRecord> {
        let mut backoff = Duration::from_secs(1);
        loop {
            self.set_state(ProvisionerState::Check).await;
            match self.check(ip_addresses, dns_names).await? {
                Some(record) => {
                    self.set_state(ProvisionerState::Run).await;
                    return Ok(record);
                }
                None => {}
            }

            self.set_state(ProvisionerState::SpinUpValidator).await;
            let attempt = self.provision_once(ip_addresses, dns_names).await;

            match attempt {
                Ok(record) => {
                    self.set_state(ProvisionerState::Install).await;
                    self.install(&record).await?;
                    self.set_state(ProvisionerState::Run).await;
                    return Ok(record);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cert: provisioning attempt failed, backing off");
                    self.set_state(ProvisionerState::Backoff).await;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.notified() => {
                            return Err(e);
                        }
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    /// CHECK: absent, near-expiry, stale SAN, or issuer mismatch all trigger
    /// renewal (returns `None`); otherwise the current leaf is still valid.
    async fn check(
        &self,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<Option<CertificateRecord>> {
        let Some(bytes) = self.store.read(CERT_NAMESPACE, LEAF_RECORD_NAME).await? else {
            return Ok(None);
        };
        let record: CertificateRecord = serde_json::from_slice(&bytes)
            .map_err(|e| ClusterError::Storage(format!("corrupt leaf record: {e}")))?;

        let now = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        if record.not_after.saturating_sub(now) < RENEWAL_LEADTIME_SECS.min(self.renewal_leadtime_secs) {
            return Ok(None);
        }
        if !ip_addresses.iter().all(|ip| record.san_ips.contains(ip)) {
            return Ok(None);
        }
        if !dns_names.iter().all(|d| record.san_dns.contains(d)) {
            return Ok(None);
        }
        if let Some(trusted_fp) = self.trusted_ca_fingerprint().await {
            if trusted_fp != record.issuer_fingerprint {
                return Ok(None);
            }
        }

        Ok(Some(record))
    }

    async fn provision_once(
        &self,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<CertificateRecord> {
        if self.is_coordinator {
            let ca = self
                .ca
                .as_ref()
                .ok_or_else(|| ClusterError::CertProvisioningFailed("coordinator has no CA".to_string()))?;
            return ca.issue_leaf(&self.node_id, ip_addresses, dns_names).await;
        }

        let challenge = random_challenge();
        let (validator_handle, validator_port) =
            spin_up_validator(self.node_id.clone(), challenge.clone(), self.validator_port).await?;

        self.set_state(ProvisionerState::RequestCert).await;
        let result = self
            .request_cert_from_coordinator(&challenge, ip_addresses, dns_names, validator_port)
            .await;

        validator_handle.notify_waiters();
        result
    }

    async fn request_cert_from_coordinator(
        &self,
        challenge: &str,
        ip_addresses: &[String],
        dns_names: &[String],
        _validator_port: u16,
    ) -> Result<CertificateRecord> {
        if self.bootstrap_coordinators.is_empty() {
            return Err(ClusterError::CertProvisioningFailed(
                "no bootstrap coordinators configured".to_string(),
            ));
        }

        let body = CertRequestBody {
            node_id: self.node_id.clone(),
            challenge: challenge.to_string(),
            ip_addresses: ip_addresses.to_vec(),
            dns_names: dns_names.to_vec(),
            old_cert_fingerprint: None,
        };

        let mut last_err = None;
        for coordinator in &self.bootstrap_coordinators {
            let url = format!("http://{coordinator}/internal/cert-request");
            let client = reqwest::Client::new();
            match client
                .post(&url)
                .json(&body)
                .timeout(Duration::from_secs(30))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    let parsed: CertRequestResponse = response
                        .json()
                        .await
                        .map_err(|e| ClusterError::CertProvisioningFailed(e.to_string()))?;
                    let issuer_fingerprint = self.trusted_ca_fingerprint().await.unwrap_or_default();
                    return Ok(CertificateRecord {
                        cert_bytes: parsed.certificate.into_bytes(),
                        key_bytes: parsed.private_key.into_bytes(),
                        not_before: SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs(),
                        not_after: SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs()
                            + parsed.valid_days as u64 * 86_400,
                        san_ips: ip_addresses.to_vec(),
                        san_dns: dns_names.to_vec(),
                        issuer_fingerprint,
                    });
                }
                Ok(response) => {
                    last_err = Some(ClusterError::CertProvisioningFailed(format!(
                        "coordinator {coordinator} returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    last_err = Some(ClusterError::CertProvisioningFailed(format!(
                        "coordinator {coordinator} unreachable: {e}"
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ClusterError::CertProvisioningFailed("no coordinator accepted the request".to_string())
        }))
    }

    async fn install(&self, record: &CertificateRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| ClusterError::Storage(format!("serialize leaf record: {e}")))?;
        self.store.write(CERT_NAMESPACE, LEAF_RECORD_NAME, bytes).await?;
        self.store.flush().await?;
        Ok(())
    }
}

/// Binds a temporary plain-HTTP listener serving only
/// `GET /internal/cert-challenge/{token}`. Returns the shutdown `Notify` and
/// the bound port.
async fn spin_up_validator(
    node_id: String,
    challenge: String,
    preferred_port: u16,
) -> Result<(Arc<Notify>, u16)> {
    let listener = TcpListener::bind(("0.0.0.0", preferred_port))
        .await
        .map_err(|e| ClusterError::CertProvisioningFailed(format!("bind validator port: {e}")))?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| ClusterError::CertProvisioningFailed(e.to_string()))?
        .port();

    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                a = listener.accept() => a,
                _ = shutdown_clone.notified() => return,
            };
            let Ok((stream, _)) = accepted else { continue };
            let node_id = node_id.clone();
            let challenge = challenge.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let node_id = node_id.clone();
                    let challenge = challenge.clone();
                    async move { handle_challenge_request(req, node_id, challenge).await }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .http1()
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });

    Ok((shutdown, bound_port))
}

async fn handle_challenge_request(
    req: Request<Incoming>,
    node_id: String,
    challenge: String,
) -> std::result::Result<Response<Full<bytes::Bytes>>, std::convert::Infallible> {
    let path = req.uri().path();
    let prefix = "/internal/cert-challenge/";
    if let Some(token) = path.strip_prefix(prefix) {
        if token == challenge {
            let body = ChallengeResponse {
                challenge: challenge.clone(),
                node_id,
                timestamp: SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            };
            let json = serde_json::to_vec(&body).unwrap_or_default();
            return Ok(Response::new(Full::new(bytes::Bytes::from(json))));
        }
        return Ok(Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(Full::new(bytes::Bytes::new()))
            .unwrap());
    }
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(bytes::Bytes::new()))
        .unwrap())
}

fn random_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fingerprint comparison helper used by the coordinator-side handler
/// (`rpc::dispatcher`) to validate `issuer_fingerprint` on renewal — exposed
/// here so both modules share one implementation.
pub fn matches_ca(record: &CertificateRecord, ca_fingerprint: &str) -> bool {
    record.issuer_fingerprint == ca_fingerprint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_store::InMemorySecureStore;

    #[tokio::test]
    async fn coordinator_self_issues_without_network() {
        let store: Arc<dyn SecureStore> = Arc::new(InMemorySecureStore::new());
        let ca = Arc::new(CertAuthority::new(store.clone(), 3650, 365));
        ca.init().await.unwrap();
        let provisioner = CertProvisioner::new(
            "c1".to_string(),
            store,
            true,
            Some(ca),
            Vec::new(),
            8802,
            30,
        );
        let record = provisioner
            .ensure_provisioned(&["10.0.0.1".to_string()], &["c1.local".to_string()])
            .await
            .unwrap();
        assert!(!record.issuer_fingerprint.is_empty());
        assert_eq!(provisioner.state().await, ProvisionerState::Run);
    }

    #[tokio::test]
    async fn check_accepts_an_already_valid_record() {
        let store: Arc<dyn SecureStore> = Arc::new(InMemorySecureStore::new());
        let ca = Arc::new(CertAuthority::new(store.clone(), 3650, 365));
        ca.init().await.unwrap();
        let provisioner = CertProvisioner::new(
            "c1".to_string(),
            store,
            true,
            Some(ca),
            Vec::new(),
            8802,
            30,
        );
        let first = provisioner
            .ensure_provisioned(&["10.0.0.1".to_string()], &[])
            .await
            .unwrap();
        let second = provisioner
            .ensure_provisioned(&["10.0.0.1".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(first.cert_bytes, second.cert_bytes);
    }
}
