//! Server-side mTLS material. Builds an `rustls::ServerConfig` requiring a
//! client certificate signed by the cluster CA, mirroring the root-store
//! construction in `pool::ConnectionPool::build_client` but for the
//! accept side: this node's leaf cert+key is the server identity, and the
//! cluster CA is the trust anchor for verifying callers.

use crate::error::{ClusterError, Result};
use crate::pool::TlsMaterial;
use std::sync::Arc;

pub fn build_server_config(material: &TlsMaterial) -> Result<rustls::ServerConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut material.ca_pem.as_slice()) {
        let cert = cert.map_err(|e| ClusterError::TransportError(format!("invalid CA pem: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| ClusterError::TransportError(format!("invalid CA cert: {e}")))?;
    }
    let roots = Arc::new(roots);

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| ClusterError::TransportError(format!("client verifier: {e}")))?;

    let leaf_certs: Vec<_> = rustls_pemfile::certs(&mut material.leaf_cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ClusterError::TransportError(format!("invalid leaf pem: {e}")))?;
    let leaf_key = rustls_pemfile::private_key(&mut material.leaf_key_pem.as_slice())
        .map_err(|e| ClusterError::TransportError(format!("invalid leaf key: {e}")))?
        .ok_or_else(|| ClusterError::TransportError("no leaf key found".to_string()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(leaf_certs, leaf_key)
        .map_err(|e| ClusterError::TransportError(format!("server cert: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertAuthority;
    use crate::secure_store::InMemorySecureStore;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn builds_a_server_config_from_issued_material() {
        let store: StdArc<dyn crate::secure_store::SecureStore> =
            StdArc::new(InMemorySecureStore::new());
        let ca = CertAuthority::new(store, 3650, 365);
        ca.init().await.unwrap();
        let record = ca
            .issue_leaf("n1", &["127.0.0.1".to_string()], &[])
            .await
            .unwrap();

        let material = TlsMaterial {
            ca_pem: ca.ca_cert_pem().await.unwrap(),
            ca_fingerprint: ca.ca_fingerprint().await.unwrap(),
            leaf_cert_pem: record.cert_bytes,
            leaf_key_pem: record.key_bytes,
        };

        assert!(build_server_config(&material).is_ok());
    }
}
