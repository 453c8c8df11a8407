//! CertAuthority (coordinator-only) and the CertificateRecord/PendingChallenge
//! data model of SPEC_FULL §3/§4.6.

use crate::error::{ClusterError, Result};
use crate::secure_store::SecureStore;
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, ExtendedKeyUsagePurpose, SanType};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

const CA_NAMESPACE: &str = "cert";
const CA_CERT_NAME: &str = "ca-cert.pem";
const CA_KEY_NAME: &str = "ca-key.pem";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub cert_bytes: Vec<u8>,
    pub key_bytes: Vec<u8>,
    pub not_before: u64,
    pub not_after: u64,
    pub san_ips: Vec<String>,
    pub san_dns: Vec<String>,
    pub issuer_fingerprint: String,
}

/// Transient, coordinator-side: one active challenge per requester node_id;
/// a new request preempts any existing one.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub challenge_token: String,
    pub requester_node_id: String,
    pub requester_address: String,
    pub requested_sans: Vec<String>,
    pub expires_at: u64,
}

/// sha256 hex fingerprint of a DER-encoded certificate.
pub fn fingerprint(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

struct CaMaterial {
    cert: rcgen::Certificate,
    key_pair: KeyPair,
    cert_pem: Vec<u8>,
    fingerprint: String,
}

pub struct CertAuthority {
    store: Arc<dyn SecureStore>,
    ca_validity_days: i64,
    leaf_validity_days: i64,
    material: Mutex<Option<CaMaterial>>,
    pending: Mutex<HashMap<String, PendingChallenge>>,
}

impl CertAuthority {
    pub fn new(store: Arc<dyn SecureStore>, ca_validity_days: i64, leaf_validity_days: i64) -> Self {
        Self {
            store,
            ca_validity_days,
            leaf_validity_days,
            material: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Load the CA from SecureStore, generating a fresh self-signed CA
    /// (default 10y validity) if absent.
    pub async fn init(&self) -> Result<()> {
        let existing_cert = self.store.read(CA_NAMESPACE, CA_CERT_NAME).await?;
        let existing_key = self.store.read(CA_NAMESPACE, CA_KEY_NAME).await?;

        let (cert, key_pair, cert_pem) = match (existing_cert, existing_key) {
            (Some(cert_pem), Some(key_pem)) => {
                let key_pair = KeyPair::from_pem(
                    std::str::from_utf8(&key_pem)
                        .map_err(|e| ClusterError::CertProvisioningFailed(e.to_string()))?,
                )
                .map_err(|e| ClusterError::CertProvisioningFailed(format!("ca key parse: {e}")))?;
                let params = CertificateParams::from_ca_cert_pem(
                    std::str::from_utf8(&cert_pem)
                        .map_err(|e| ClusterError::CertProvisioningFailed(e.to_string()))?,
                )
                .map_err(|e| ClusterError::CertProvisioningFailed(format!("ca cert parse: {e}")))?;
                let cert = params
                    .self_signed(&key_pair)
                    .map_err(|e| ClusterError::CertProvisioningFailed(format!("ca reload: {e}")))?;
                (cert, key_pair, cert_pem)
            }
            _ => {
                tracing::info!("cert: no existing CA found, generating fresh self-signed CA");
                let (cert, key_pair) = self.generate_ca()?;
                let cert_pem = cert.pem().into_bytes();
                let key_pem = key_pair.serialize_pem().into_bytes();
                self.store
                    .write(CA_NAMESPACE, CA_CERT_NAME, cert_pem.clone())
                    .await?;
                self.store.write(CA_NAMESPACE, CA_KEY_NAME, key_pem).await?;
                (cert, key_pair, cert_pem)
            }
        };

        let fp = fingerprint(cert.der().as_ref());

        *self.material.lock().await = Some(CaMaterial {
            cert,
            key_pair,
            cert_pem,
            fingerprint: fp,
        });
        Ok(())
    }

    fn generate_ca(&self) -> Result<(rcgen::Certificate, KeyPair)> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| ClusterError::CertProvisioningFailed(format!("ca params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "clustermesh-internal-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let not_before = SystemTime::now();
        let not_after = not_before + Duration::from_secs(self.ca_validity_days as u64 * 86_400);
        params.not_before = not_before.into();
        params.not_after = not_after.into();

        let key_pair = KeyPair::generate()
            .map_err(|e| ClusterError::CertProvisioningFailed(format!("ca key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ClusterError::CertProvisioningFailed(format!("ca self-sign: {e}")))?;

        Ok((cert, key_pair))
    }

    pub async fn ca_cert_pem(&self) -> Option<Vec<u8>> {
        self.material.lock().await.as_ref().map(|m| m.cert_pem.clone())
    }

    pub async fn ca_fingerprint(&self) -> Option<String> {
        self.material.lock().await.as_ref().map(|m| m.fingerprint.clone())
    }

    /// Record a challenge for `node_id`, replacing any existing one.
    pub async fn open_challenge(&self, node_id: &str, challenge: PendingChallenge) {
        self.pending.lock().await.insert(node_id.to_string(), challenge);
    }

    pub async fn pending_challenge(&self, node_id: &str) -> Option<PendingChallenge> {
        self.pending.lock().await.get(node_id).cloned()
    }

    pub async fn clear_challenge(&self, node_id: &str) {
        self.pending.lock().await.remove(node_id);
    }

    /// Build a leaf cert for `node_id`: CN=node_id, SAN = dedup(ip_addresses + dns_names),
    /// 365d validity, CA=FALSE, digitalSignature+keyEncipherment,
    /// serverAuth+clientAuth. Signs with the CA key.
    pub async fn issue_leaf(
        &self,
        node_id: &str,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<CertificateRecord> {
        let mut sans: Vec<String> = Vec::new();
        for ip in ip_addresses {
            if !sans.contains(ip) {
                sans.push(ip.clone());
            }
        }
        for dns in dns_names {
            if !sans.contains(dns) {
                sans.push(dns.clone());
            }
        }

        let san_types: Vec<SanType> = sans
            .iter()
            .map(|s| {
                if let Ok(ip) = s.parse::<std::net::IpAddr>() {
                    SanType::IpAddress(ip)
                } else {
                    SanType::DnsName(s.clone().try_into().expect("valid dns name"))
                }
            })
            .collect();

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| ClusterError::CertProvisioningFailed(format!("leaf params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        params.distinguished_name = dn;
        params.subject_alt_names = san_types;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let not_before = SystemTime::now();
        let not_after = not_before + Duration::from_secs(self.leaf_validity_days as u64 * 86_400);
        params.not_before = not_before.into();
        params.not_after = not_after.into();

        let leaf_key = KeyPair::generate()
            .map_err(|e| ClusterError::CertProvisioningFailed(format!("leaf key: {e}")))?;

        let guard = self.material.lock().await;
        let material = guard
            .as_ref()
            .ok_or_else(|| ClusterError::CertProvisioningFailed("CA not initialized".to_string()))?;

        let leaf_cert = params
            .signed_by(&leaf_key, &material.cert, &material.key_pair)
            .map_err(|e| ClusterError::CertProvisioningFailed(format!("leaf sign: {e}")))?;

        Ok(CertificateRecord {
            cert_bytes: leaf_cert.pem().into_bytes(),
            key_bytes: leaf_key.serialize_pem().into_bytes(),
            not_before: not_before
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            not_after: not_after
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            san_ips: ip_addresses.to_vec(),
            san_dns: dns_names.to_vec(),
            issuer_fingerprint: material.fingerprint.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_store::InMemorySecureStore;

    #[tokio::test]
    async fn init_generates_ca_when_absent() {
        let store: Arc<dyn SecureStore> = Arc::new(InMemorySecureStore::new());
        let ca = CertAuthority::new(store, 3650, 365);
        ca.init().await.unwrap();
        assert!(ca.ca_cert_pem().await.is_some());
        assert!(ca.ca_fingerprint().await.is_some());
    }

    #[tokio::test]
    async fn issue_leaf_has_matching_issuer_fingerprint() {
        let store: Arc<dyn SecureStore> = Arc::new(InMemorySecureStore::new());
        let ca = CertAuthority::new(store, 3650, 365);
        ca.init().await.unwrap();
        let leaf = ca
            .issue_leaf("w1", &["10.0.0.2".to_string()], &["w1.local".to_string()])
            .await
            .unwrap();
        assert_eq!(leaf.issuer_fingerprint, ca.ca_fingerprint().await.unwrap());
        assert_eq!(leaf.san_ips, vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn challenge_is_preempted_by_new_request() {
        let store: Arc<dyn SecureStore> = Arc::new(InMemorySecureStore::new());
        let ca = CertAuthority::new(store, 3650, 365);
        ca.open_challenge(
            "w1",
            PendingChallenge {
                challenge_token: "a".to_string(),
                requester_node_id: "w1".to_string(),
                requester_address: "10.0.0.2".to_string(),
                requested_sans: vec![],
                expires_at: 0,
            },
        )
        .await;
        ca.open_challenge(
            "w1",
            PendingChallenge {
                challenge_token: "b".to_string(),
                requester_node_id: "w1".to_string(),
                requester_address: "10.0.0.2".to_string(),
                requested_sans: vec![],
                expires_at: 0,
            },
        )
        .await;
        assert_eq!(ca.pending_challenge("w1").await.unwrap().challenge_token, "b");
    }
}
