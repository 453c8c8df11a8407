use thiserror::Error;

/// Tagged error kinds for the cluster core. Every fallible operation in this
/// crate returns one of these, never a bare string — callers match on the
/// variant to decide retriable vs terminal handling.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("duplicate method registration: {0}")]
    DuplicateMethod(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("invalid proxy path: {0}")]
    InvalidProxyPath(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("remote error {code}: {message}")]
    RemoteError { code: i64, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("certificate provisioning failed: {0}")]
    CertProvisioningFailed(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ClusterError {
    /// Whether a caller should retry this class of error. Mirrors the
    /// retriable/terminal split called out in spec §9 (Timeout,
    /// TransportError, CertProvisioningFailed are retriable; the rest are not).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout(_)
                | ClusterError::TransportError(_)
                | ClusterError::CertProvisioningFailed(_)
        )
    }

    /// JSON-RPC 2.0 error code this kind maps to at the dispatcher boundary
    /// (spec §7).
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ClusterError::MethodNotFound(_) => -32601,
            ClusterError::RateLimited { .. } => -32000,
            ClusterError::TransportError(_) | ClusterError::Timeout(_) => -32001,
            ClusterError::RemoteError { code, .. } => *code,
            _ => -32002,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
