//! Admin HTTP endpoint: `GET /metrics` in Prometheus text format. Only bound
//! when `metrics_listen_address` is configured. Trimmed from the teacher's
//! `server::admin::handle_admin`, which also served routing-table introspection
//! endpoints this node has no equivalent of.

use crate::metrics::Metrics;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

fn handle(req: Request<Incoming>, metrics: &Metrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(metrics.render())))
            .unwrap(),
        "/health" | "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"{\"status\":\"ok\"}")))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    }
}

pub async fn serve(
    listen: SocketAddr,
    metrics: Metrics,
    shutdown: Arc<Notify>,
) -> crate::error::Result<()> {
    let listener = TcpListener::bind(listen).await.map_err(|e| {
        crate::error::ClusterError::TransportError(format!("bind admin {listen}: {e}"))
    })?;
    tracing::info!(addr = %listen, "admin: metrics endpoint listening");

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => return Ok(()),
        };
        let Ok((stream, _)) = accepted else { continue };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let metrics = metrics.clone();
                async move { Ok::<_, std::convert::Infallible>(handle(req, &metrics)) }
            });
            let _ = auto::Builder::new(TokioExecutor::new())
                .http1()
                .serve_connection_with_upgrades(io, svc)
                .await;
        });
    }
}
