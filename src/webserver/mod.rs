//! HTTP API.
//!
//! Serves the Prometheus scrape endpoint and per job vertex metrics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::extract::Path;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use prometheus::Encoder;
use prometheus::TextEncoder;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::Error;
use crate::errors::Result;
use crate::metrics::JobVertexMetricsHandler;
use crate::metrics::SharedMetricStore;

struct State {
    metrics: SharedMetricStore,
}

fn app(metrics: SharedMetricStore) -> Router {
    let shared_state = Arc::new(State { metrics });

    Router::new()
        .route("/metrics", get(get_metrics))
        .route(
            "/jobs/:jobid/vertices/:vertexid/metrics",
            get(get_vertex_metrics),
        )
        .layer(Extension(shared_state))
}

/// A running API server.
pub struct ApiServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl ApiServer {
    /// Bind `addr` and serve on the current runtime.
    ///
    /// Use port 0 to pick any free port; [`ApiServer::local_addr`]
    /// tells which.
    pub async fn start(addr: SocketAddr, metrics: SharedMetricStore) -> Result<Self> {
        let server = axum::Server::try_bind(&addr)
            .map_err(|err| Error::Http(format!("unable to bind API server to {addr}: {err}")))?
            .serve(app(metrics).into_make_service());
        let local_addr = server.local_addr();
        tracing::info!("Starting API server on {local_addr:?}");

        let (tx, rx) = oneshot::channel();
        let graceful = server.with_graceful_shutdown(async {
            rx.await.ok();
        });
        let handle = tokio::spawn(async move {
            graceful
                .await
                .map_err(|err| Error::Http(format!("API server failed: {err}")))
        });
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for open ones to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        match self.handle.await {
            Ok(res) => res,
            Err(err) => Err(Error::Http(format!("API server task died: {err}"))),
        }
    }
}

async fn get_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buf) {
        tracing::error!("Error encoding metrics: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buf,
    )
        .into_response()
}

async fn get_vertex_metrics(
    Path(params): Path<HashMap<String, String>>,
    Extension(state): Extension<Arc<State>>,
) -> Response {
    let found = match state.metrics.read() {
        Ok(store) => JobVertexMetricsHandler::get_map_for(&params, &store),
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "metric store poisoned").into_response()
        }
    };
    match found {
        Some(metrics) => Json(metrics).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;
    use crate::metrics::MetricStore;
    use crate::model::*;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_vertex_metrics() {
        let metrics = MetricStore::shared();
        metrics.write().unwrap().add_task_metric(
            JobId(1),
            OperatorId(2),
            SubtaskIndex(0),
            "numRecordsIn",
            12,
        );
        let server = ApiServer::start(SocketAddr::from(([127, 0, 0, 1], 0)), metrics)
            .await
            .unwrap();
        let addr = server.local_addr();

        let path = format!("/jobs/{}/vertices/{}/metrics", JobId(1), OperatorId(2));
        let response = http_get(addr, &path).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(r#"{"0.numRecordsIn":"12"}"#), "{response}");

        let path = format!("/jobs/{}/vertices/{}/metrics", JobId(1), OperatorId(3));
        let response = http_get(addr, &path).await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        let response = http_get(addr, "/jobs/nope/vertices/nope/metrics").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn serves_prometheus_text() {
        crate::metrics::initialize_metrics().unwrap();
        let server = ApiServer::start(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            MetricStore::shared(),
        )
        .await
        .unwrap();
        let response = http_get(server.local_addr(), "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("text/plain"), "{response}");
        server.stop().await.unwrap();
    }
}
