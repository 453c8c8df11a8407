//! ConnectionPool — per-peer mTLS client pool keyed by node_id (SPEC_FULL
//! §4.5). Grounds the pooled `hyper_util::client::legacy::Client` directly in
//! the teacher's `build_cluster_http_client` (`upstream/cluster.rs`), but
//! swaps the teacher's optional/no-verify `ClientConfig` for one that always
//! requires the cluster CA root and presents the local leaf cert+key
//! (`with_client_auth_cert`), since every call in this spec is mTLS.

use crate::error::{ClusterError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type PooledClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

struct PoolEntry {
    client: PooledClient,
    ca_fingerprint: String,
    last_used: AtomicU64,
}

/// Trust material used to build per-peer TLS clients: the cluster CA root
/// (for verifying the remote's leaf) plus this node's own leaf cert+key (for
/// client auth under mTLS). Swappable when CertProvisioner installs a
/// renewed leaf.
pub struct TlsMaterial {
    pub ca_pem: Vec<u8>,
    pub ca_fingerprint: String,
    pub leaf_cert_pem: Vec<u8>,
    pub leaf_key_pem: Vec<u8>,
}

pub struct ConnectionPool {
    entries: DashMap<String, Arc<PoolEntry>>,
    material: arc_swap::ArcSwapOption<TlsMaterial>,
    max_total: usize,
    max_idle_per_peer: usize,
    unverified: bool,
}

impl ConnectionPool {
    pub fn new(max_total: usize, max_idle_per_peer: usize) -> Self {
        Self {
            entries: DashMap::new(),
            material: arc_swap::ArcSwapOption::empty(),
            max_total,
            max_idle_per_peer,
            unverified: false,
        }
    }

    /// Test/bootstrap-only constructor: skips remote cert verification and
    /// carries no client identity. Used before a leaf cert has been
    /// provisioned (the cert-request bootstrap leg runs over plain HTTP and
    /// never touches this pool) and in unit tests that never actually dial
    /// out.
    pub fn new_unverified(max_total: usize, max_idle_per_peer: usize) -> Self {
        Self {
            entries: DashMap::new(),
            material: arc_swap::ArcSwapOption::empty(),
            max_total,
            max_idle_per_peer,
            unverified: true,
        }
    }

    /// Install new TLS trust material (fresh CA fingerprint and/or renewed
    /// leaf). Existing pooled clients are not immediately evicted; they are
    /// discarded lazily on next lookup once their fingerprint no longer
    /// matches.
    pub fn set_material(&self, material: TlsMaterial) {
        self.material.store(Some(Arc::new(material)));
    }

    fn current_fingerprint(&self) -> String {
        self.material
            .load()
            .as_ref()
            .map(|m| m.ca_fingerprint.clone())
            .unwrap_or_default()
    }

    fn get_or_build(&self, node_id: &str) -> Result<PooledClient> {
        let fingerprint = self.current_fingerprint();

        if let Some(entry) = self.entries.get(node_id) {
            if entry.ca_fingerprint == fingerprint {
                entry.last_used.store(now_secs(), Ordering::Relaxed);
                return Ok(entry.client.clone());
            }
        }

        let client = self.build_client()?;
        self.entries.insert(
            node_id.to_string(),
            Arc::new(PoolEntry {
                client: client.clone(),
                ca_fingerprint: fingerprint,
                last_used: AtomicU64::new(now_secs()),
            }),
        );
        self.evict_if_over_cap();
        Ok(client)
    }

    fn build_client(&self) -> Result<PooledClient> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let tls_config = if self.unverified {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let material = self.material.load();
            let material = material
                .as_ref()
                .ok_or_else(|| ClusterError::TransportError("no TLS material installed".to_string()))?;

            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut material.ca_pem.as_slice()) {
                let cert = cert.map_err(|e| {
                    ClusterError::TransportError(format!("invalid CA pem: {e}"))
                })?;
                roots
                    .add(cert)
                    .map_err(|e| ClusterError::TransportError(format!("invalid CA cert: {e}")))?;
            }

            let leaf_certs: Vec<_> = rustls_pemfile::certs(&mut material.leaf_cert_pem.as_slice())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ClusterError::TransportError(format!("invalid leaf pem: {e}")))?;
            let leaf_key = rustls_pemfile::private_key(&mut material.leaf_key_pem.as_slice())
                .map_err(|e| ClusterError::TransportError(format!("invalid leaf key: {e}")))?
                .ok_or_else(|| ClusterError::TransportError("no leaf key found".to_string()))?;

            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_client_auth_cert(leaf_certs, leaf_key)
                .map_err(|e| ClusterError::TransportError(format!("client auth cert: {e}")))?
        };

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_only()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        Ok(Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(self.max_idle_per_peer)
            .build(https))
    }

    /// Least-recently-used peer clients are closed when the pool exceeds
    /// `max_total` entries.
    fn evict_if_over_cap(&self) {
        if self.entries.len() <= self.max_total {
            return;
        }
        let overflow = self.entries.len() - self.max_total;
        let mut by_age: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_used.load(Ordering::Relaxed)))
            .collect();
        by_age.sort_by_key(|(_, t)| *t);
        for (key, _) in by_age.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
    }

    pub fn idle_cap_per_peer(&self) -> usize {
        self.max_idle_per_peer
    }

    /// POST a JSON-serialized body to `https://<address>:<port><path>`,
    /// enforcing `deadline`. Exceeding it surfaces as `kind=Timeout`.
    pub async fn post_json<T: Serialize>(
        &self,
        node_id: &str,
        address: &str,
        port: u16,
        path: &str,
        body: &T,
        deadline: Duration,
    ) -> Result<Bytes> {
        let client = self.get_or_build(node_id)?;
        let payload = serde_json::to_vec(body)
            .map_err(|e| ClusterError::TransportError(format!("serialize request: {e}")))?;

        let uri: http::Uri = format!("https://{address}:{port}{path}")
            .parse()
            .map_err(|e| ClusterError::TransportError(format!("invalid uri: {e}")))?;

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ClusterError::TransportError(e.to_string()))?;

        let send = async {
            let response = client
                .request(request)
                .await
                .map_err(|e| ClusterError::TransportError(e.to_string()))?;
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClusterError::TransportError(e.to_string()))?
                .to_bytes();
            Ok::<_, ClusterError>(body)
        };

        match tokio::time::timeout(deadline, send).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(deadline)),
        }
    }

    /// POST a raw byte payload (the gossip wire frame) to
    /// `https://<address>:<port><path>`, enforcing `deadline`.
    pub async fn post_bytes(
        &self,
        node_id: &str,
        address: &str,
        port: u16,
        path: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Bytes> {
        let client = self.get_or_build(node_id)?;

        let uri: http::Uri = format!("https://{address}:{port}{path}")
            .parse()
            .map_err(|e| ClusterError::TransportError(format!("invalid uri: {e}")))?;

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ClusterError::TransportError(e.to_string()))?;

        let send = async {
            let response = client
                .request(request)
                .await
                .map_err(|e| ClusterError::TransportError(e.to_string()))?;
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClusterError::TransportError(e.to_string()))?
                .to_bytes();
            Ok::<_, ClusterError>(body)
        };

        match tokio::time::timeout(deadline, send).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(deadline)),
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Accept-any verifier used only before a leaf cert is provisioned. Mirrors
/// the teacher's `NoVerifier` in `upstream/cluster.rs`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_lru_when_over_cap() {
        let pool = ConnectionPool::new_unverified(2, 4);
        for id in ["a", "b", "c"] {
            pool.get_or_build(id).unwrap();
        }
        assert_eq!(pool.entries.len(), 2);
        assert!(!pool.entries.contains_key("a"));
    }

    #[test]
    fn fingerprint_change_discards_old_client() {
        let pool = ConnectionPool::new(8, 4);
        pool.set_material(TlsMaterial {
            ca_pem: Vec::new(),
            ca_fingerprint: "fp1".to_string(),
            leaf_cert_pem: Vec::new(),
            leaf_key_pem: Vec::new(),
        });
        // unverified=false with empty PEMs would fail cert building, so this
        // only asserts the fingerprint bookkeeping, not a full TLS handshake.
        assert_eq!(pool.current_fingerprint(), "fp1");
        pool.set_material(TlsMaterial {
            ca_pem: Vec::new(),
            ca_fingerprint: "fp2".to_string(),
            leaf_cert_pem: Vec::new(),
            leaf_key_pem: Vec::new(),
        });
        assert_eq!(pool.current_fingerprint(), "fp2");
    }
}
