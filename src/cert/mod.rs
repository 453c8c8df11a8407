//! CertAuthority / CertProvisioner — the ACME-like issuance flow of
//! SPEC_FULL §4.6. Certificate math uses `rcgen`, the pack's standard for
//! self-signed/CA certificate generation (`examples/hlieu5402-collab-spark2026`,
//! `examples/maidsafe-temp_safe_network/qjsonrpc`).

mod authority;
mod provisioner;

pub use authority::{fingerprint, CertAuthority, CertificateRecord, PendingChallenge};
pub use provisioner::{CertProvisioner, ProvisionerState, REMOTE_CA_CERT_NAME};
