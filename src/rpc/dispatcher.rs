//! RpcDispatcher (SPEC_FULL §4.4 and §6 "External interfaces"): the mTLS
//! HTTPS listener serving `POST /rpc` and `GET /health`, plus a companion
//! plain-HTTP bootstrap listener (coordinator only) serving
//! `GET /internal/ca-cert` and `POST /internal/cert-request`. The
//! accept-loop shape (track in-flight connections, drain on shutdown) is
//! grounded directly in the teacher's `server::run_proxy_server`.

use crate::cert::{CertAuthority, PendingChallenge};
use crate::directory::NodeDirectory;
use crate::error::ClusterError;
use crate::gossip::Gossip;
use crate::ratelimit::{Admission, EndpointClass, RateLimiter};
use crate::rpc::envelope::{RpcRequest, RpcResponse};
use crate::rpc::registry::MethodRegistry;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::Notify;

pub struct RpcDispatcher {
    registry: Arc<MethodRegistry>,
    directory: NodeDirectory,
    rate_limiter: Arc<RateLimiter>,
    ca: Option<Arc<CertAuthority>>,
    bearer_token: Option<String>,
    gossip: Arc<Gossip>,
    tls_acceptor: arc_swap::ArcSwapOption<tokio_rustls::TlsAcceptor>,
}

#[derive(Serialize, Deserialize)]
struct CertRequestBody {
    node_id: String,
    challenge: String,
    ip_addresses: Vec<String>,
    dns_names: Vec<String>,
    #[serde(default)]
    old_cert_fingerprint: Option<String>,
}

#[derive(Serialize)]
struct CertRequestResponse {
    certificate: String,
    private_key: String,
    node_id: String,
    valid_days: i64,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    challenge: String,
    node_id: String,
}

impl RpcDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<MethodRegistry>,
        directory: NodeDirectory,
        rate_limiter: Arc<RateLimiter>,
        ca: Option<Arc<CertAuthority>>,
        bearer_token: Option<String>,
        gossip: Arc<Gossip>,
    ) -> Self {
        Self {
            registry,
            directory,
            rate_limiter,
            ca,
            bearer_token,
            gossip,
            tls_acceptor: arc_swap::ArcSwapOption::empty(),
        }
    }

    /// Installed once a leaf cert is available (INSTALL phase). Rebuilding
    /// on renewal hot-swaps the acceptor for subsequent connections; existing
    /// connections are unaffected.
    pub fn set_tls_config(&self, config: rustls::ServerConfig) {
        self.tls_acceptor
            .store(Some(Arc::new(tokio_rustls::TlsAcceptor::from(Arc::new(
                config,
            )))));
    }

    /// Main mTLS listener: `POST /rpc`, `GET /health`.
    pub async fn serve(
        self: Arc<Self>,
        listen: SocketAddr,
        shutdown: Arc<Notify>,
    ) -> crate::error::Result<()> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| ClusterError::TransportError(format!("bind {listen}: {e}")))?;
        tracing::info!(addr = %listen, "rpc: dispatcher listening");

        let active = Arc::new(AtomicI64::new(0));

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => {
                    tracing::info!("rpc: dispatcher: stop accepting new connections");
                    break;
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(error = %e, "rpc: accept failed");
                    continue;
                }
            };

            let Some(acceptor) = self.tls_acceptor.load_full() else {
                tracing::warn!("rpc: connection rejected, no TLS material installed yet");
                continue;
            };

            let this = self.clone();
            active.fetch_add(1, Ordering::Relaxed);
            let active_count = active.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!(peer = %peer_addr, error = %e, "rpc: tls handshake failed");
                        active_count.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                };

                let caller_identity = peer_node_id(&tls_stream).unwrap_or_else(|| peer_addr.ip().to_string());

                let io = TokioIo::new(tls_stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let this = this.clone();
                    let caller_identity = caller_identity.clone();
                    async move { this.handle_request(req, caller_identity).await }
                });

                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .http1()
                    .keep_alive(true)
                    .http2()
                    .keep_alive_interval(Some(Duration::from_secs(20)))
                    .serve_connection_with_upgrades(io, svc)
                    .await
                {
                    if !e.to_string().contains("connection closed") {
                        tracing::debug!(peer = %peer_addr, error = %e, "rpc: connection error");
                    }
                }

                active_count.fetch_sub(1, Ordering::Relaxed);
            });
        }

        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        caller_identity: String,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        if let Some(expected) = &self.bearer_token {
            let provided = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if provided != Some(expected.as_str()) {
                return Ok(json_response(StatusCode::UNAUTHORIZED, b"{}".to_vec(), None));
            }
        }

        match (method.as_str(), path.as_str()) {
            ("GET", "/health") => Ok(self.handle_health(&caller_identity).await),
            ("POST", "/rpc") => Ok(self.handle_rpc(req, &caller_identity).await),
            ("POST", "/internal/gossip") => Ok(self.handle_gossip(req, &caller_identity).await),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::new()))
                .unwrap()),
        }
    }

    async fn handle_gossip(&self, req: Request<Incoming>, caller_identity: &str) -> Response<Full<Bytes>> {
        if let Admission::Rejected { retry_after_secs } =
            self.rate_limiter.check(EndpointClass::Internal, caller_identity).await
        {
            return rate_limited_response(retry_after_secs);
        }
        let body_bytes = match req.into_body().collect().await {
            Ok(b) => b.to_bytes(),
            Err(_) => return plain_status(StatusCode::BAD_REQUEST),
        };
        match crate::gossip::decode_frame(&body_bytes) {
            Ok(frame) => {
                let digest = crate::gossip::Digest {
                    entries: frame.entries,
                };
                self.gossip.receive(&frame.from, digest);
                plain_status(StatusCode::OK)
            }
            Err(_) => plain_status(StatusCode::BAD_REQUEST),
        }
    }

    async fn handle_health(&self, caller_identity: &str) -> Response<Full<Bytes>> {
        if let Admission::Rejected { retry_after_secs } =
            self.rate_limiter.check(EndpointClass::Health, caller_identity).await
        {
            return rate_limited_response(retry_after_secs);
        }
        let body = serde_json::json!({
            "status": "ok",
            "node_id": self.directory.self_id(),
            "peers": self.directory.len(),
        });
        json_response(StatusCode::OK, serde_json::to_vec(&body).unwrap_or_default(), None)
    }

    async fn handle_rpc(&self, req: Request<Incoming>, caller_identity: &str) -> Response<Full<Bytes>> {
        if let Admission::Rejected { retry_after_secs } =
            self.rate_limiter.check(EndpointClass::Rpc, caller_identity).await
        {
            return rate_limited_response(retry_after_secs);
        }

        let body_bytes = match req.into_body().collect().await {
            Ok(b) => b.to_bytes(),
            Err(_) => {
                let resp = RpcResponse::parse_error();
                return json_response(
                    StatusCode::BAD_REQUEST,
                    serde_json::to_vec(&resp).unwrap_or_default(),
                    None,
                );
            }
        };

        let request: RpcRequest = match serde_json::from_slice(&body_bytes) {
            Ok(r) => r,
            Err(_) => {
                let resp = RpcResponse::parse_error();
                return json_response(
                    StatusCode::BAD_REQUEST,
                    serde_json::to_vec(&resp).unwrap_or_default(),
                    None,
                );
            }
        };

        let start = std::time::Instant::now();
        let result = self.registry.execute(&request.method, request.params).await;
        metrics::counter!("cluster_rpc_requests_total").increment(1);
        metrics::histogram!("cluster_rpc_latency_seconds").record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::counter!("cluster_rpc_errors_total").increment(1);
        }
        let response = match result {
            Ok(value) => RpcResponse::success(request.id, value),
            Err(err) => RpcResponse::failure(request.id, &err),
        };

        json_response(
            StatusCode::OK,
            serde_json::to_vec(&response).unwrap_or_default(),
            None,
        )
    }

    /// Companion plain-HTTP bootstrap listener: `GET /internal/ca-cert`,
    /// `POST /internal/cert-request`. Only meaningful on a coordinator (a
    /// worker's `self.ca` is `None`, so both paths 404).
    pub async fn serve_bootstrap(
        self: Arc<Self>,
        listen: SocketAddr,
        shutdown: Arc<Notify>,
    ) -> crate::error::Result<()> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| ClusterError::TransportError(format!("bind {listen}: {e}")))?;
        tracing::info!(addr = %listen, "rpc: bootstrap listener listening");

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => return Ok(()),
            };
            let Ok((stream, _)) = accepted else { continue };
            let this = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let this = this.clone();
                    async move { this.handle_bootstrap_request(req).await }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .http1()
                    .keep_alive(true)
                    .serve_connection_with_upgrades(io, svc)
                    .await;
            });
        }
    }

    async fn handle_bootstrap_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let Some(ca) = &self.ca else {
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::new()))
                .unwrap());
        };

        match (method.as_str(), path.as_str()) {
            ("GET", "/internal/ca-cert") => {
                let pem = ca.ca_cert_pem().await.unwrap_or_default();
                Ok(Response::new(Full::new(Bytes::from(pem))))
            }
            ("POST", "/internal/cert-request") => Ok(self.handle_cert_request(req, ca).await),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::new()))
                .unwrap()),
        }
    }

    /// AWAIT_CALLBACK: fetches the requester's challenge endpoint to confirm
    /// it is the node it claims to be, then issues the leaf.
    async fn handle_cert_request(
        &self,
        req: Request<Incoming>,
        ca: &Arc<CertAuthority>,
    ) -> Response<Full<Bytes>> {
        let body_bytes = match req.into_body().collect().await {
            Ok(b) => b.to_bytes(),
            Err(_) => return plain_status(StatusCode::BAD_REQUEST),
        };
        let body: CertRequestBody = match serde_json::from_slice(&body_bytes) {
            Ok(b) => b,
            Err(_) => return plain_status(StatusCode::BAD_REQUEST),
        };

        let requester_address = body
            .ip_addresses
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());

        ca.open_challenge(
            &body.node_id,
            PendingChallenge {
                challenge_token: body.challenge.clone(),
                requester_node_id: body.node_id.clone(),
                requester_address: requester_address.clone(),
                requested_sans: body
                    .ip_addresses
                    .iter()
                    .chain(body.dns_names.iter())
                    .cloned()
                    .collect(),
                expires_at: SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
                    + 60,
            },
        )
        .await;

        let confirmed = self
            .fetch_and_verify_challenge(&requester_address, &body.node_id, &body.challenge)
            .await;

        ca.clear_challenge(&body.node_id).await;

        if !confirmed {
            return plain_status(StatusCode::FORBIDDEN);
        }

        match ca
            .issue_leaf(&body.node_id, &body.ip_addresses, &body.dns_names)
            .await
        {
            Ok(record) => {
                let response = CertRequestResponse {
                    certificate: String::from_utf8_lossy(&record.cert_bytes).to_string(),
                    private_key: String::from_utf8_lossy(&record.key_bytes).to_string(),
                    node_id: body.node_id,
                    valid_days: ((record.not_after.saturating_sub(record.not_before)) / 86_400) as i64,
                };
                json_response(
                    StatusCode::OK,
                    serde_json::to_vec(&response).unwrap_or_default(),
                    None,
                )
            }
            Err(_) => plain_status(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    async fn fetch_and_verify_challenge(
        &self,
        requester_address: &str,
        node_id: &str,
        challenge: &str,
    ) -> bool {
        let crate::config::CertConfig {
            validator_http_port, ..
        } = crate::config::CertConfig::default();
        let url =
            format!("http://{requester_address}:{validator_http_port}/internal/cert-challenge/{challenge}");
        let client = reqwest::Client::new();
        let Ok(response) = client.get(&url).timeout(Duration::from_secs(10)).send().await else {
            return false;
        };
        if !response.status().is_success() {
            return false;
        }
        let Ok(parsed) = response.json::<ChallengeResponse>().await else {
            return false;
        };
        parsed.challenge == challenge && parsed.node_id == node_id
    }
}

fn json_response(status: StatusCode, body: Vec<u8>, retry_after_secs: Option<u64>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(secs) = retry_after_secs {
        builder = builder.header(http::header::RETRY_AFTER, secs.to_string());
    }
    builder.body(Full::new(Bytes::from(body))).unwrap()
}

fn rate_limited_response(retry_after_secs: u64) -> Response<Full<Bytes>> {
    let resp = RpcResponse::failure(
        "null".to_string(),
        &ClusterError::RateLimited { retry_after_secs },
    );
    json_response(
        StatusCode::TOO_MANY_REQUESTS,
        serde_json::to_vec(&resp).unwrap_or_default(),
        Some(retry_after_secs),
    )
}

fn plain_status(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder().status(status).body(Full::new(Bytes::new())).unwrap()
}

/// Best-effort extraction of the peer's `node_id` from its mTLS leaf
/// certificate's CommonName — every leaf this cluster issues (`CertAuthority::issue_leaf`)
/// sets CN=node_id. Falls back to `None` (caller then keys rate limiting by
/// source IP) if the peer presented no cert or it doesn't parse as one we
/// recognize.
fn peer_node_id<IO>(stream: &tokio_rustls::server::TlsStream<IO>) -> Option<String> {
    let (_, session) = stream.get_ref();
    let certs = session.peer_certificates()?;
    let leaf = certs.first()?;
    let params = rcgen::CertificateParams::from_ca_cert_der(leaf).ok()?;
    params
        .distinguished_name
        .get(&rcgen::DnType::CommonName)
        .map(|v| v.to_string())
}
