use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::MetricsCollector;

/// Serves `/metrics` (Prometheus text) and `/metrics.json` on the current
/// tokio runtime for the duration of a run.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl MetricsServer {
    /// Must be called from within a tokio runtime.
    pub fn spawn(listen: SocketAddr, collector: MetricsCollector) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let builder = hyper::Server::try_bind(&listen)
            .with_context(|| format!("Failed to bind metrics server on {listen}"))?;

        let make_svc = make_service_fn(move |_| {
            let collector = collector.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let collector = collector.clone();
                    async move { Ok::<_, Infallible>(handle_request(req, &collector)) }
                }))
            }
        });

        let server = builder.serve(make_svc);
        let address = server.local_addr();
        let graceful = server.with_graceful_shutdown(async move {
            let _ = rx.await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                error!(error = %err, "Metrics server error");
            }
        });
        info!(%address, "Metrics server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            task: Some(task),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn handle_request(req: Request<Body>, collector: &MetricsCollector) -> Response<Body> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Body::from(collector.snapshot().to_prometheus()),
        ),
        (&Method::GET, "/metrics.json") => (
            StatusCode::OK,
            "application/json",
            Body::from(serde_json::to_vec(&collector.snapshot()).unwrap_or_else(|_| b"{}".to_vec())),
        ),
        _ => (StatusCode::NOT_FOUND, "text/plain", Body::from("Not Found")),
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_prometheus_text() {
        let collector = MetricsCollector::new();
        drop(collector.start_stage("build"));
        let mut server = MetricsServer::spawn("127.0.0.1:0".parse().unwrap(), collector).unwrap();

        let client = hyper::Client::new();
        let uri = format!("http://{}/metrics", server.address()).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("pipewright_stage_calls_total{stage=\"build\"} 1"));

        server.stop().await;
    }
}
