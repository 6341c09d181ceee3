//! Prometheus scrape endpoint.
//!
//! One type owns both the recorder install and the accept loop; the
//! recorder can only be installed once per process, so construction at
//! startup doubles as the guard.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Per-call packet loss is a ratio in [0, 1].
const LOSS_BUCKETS: &[f64] = &[0.0, 0.01, 0.02, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Voice transmissions run from a key-bounce to a few minutes.
const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 3.0, 10.0, 30.0, 60.0, 180.0];

pub struct MetricsExporter {
    handle: Arc<PrometheusHandle>,
    addr: SocketAddr,
}

impl MetricsExporter {
    /// Parses the listen address and installs the global recorder. Fails
    /// (rather than panicking) when called twice.
    pub fn install(listen: &str) -> Result<Self> {
        let addr = listen.parse().context("metrics listen address")?;
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("_call_loss".into()), LOSS_BUCKETS)?
            .set_buckets_for_metric(
                Matcher::Suffix("_call_duration_seconds".into()),
                DURATION_BUCKETS,
            )?
            .install_recorder()
            .context("install prometheus recorder")?;

        Ok(Self { handle: Arc::new(handle), addr })
    }

    /// Accept loop for scrapes; runs until the listener errors.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("bind metrics listener {}", self.addr))?;
        info!("metrics endpoint on http://{}/metrics", self.addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            let handle = self.handle.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handle = handle.clone();
                    async move { Ok::<_, std::convert::Infallible>(scrape(&req, &handle)) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(%peer, "metrics connection ended: {e}");
                }
            });
        }
    }
}

fn scrape(req: &Request<Incoming>, handle: &PrometheusHandle) -> Response<Full<Bytes>> {
    if req.uri().path() != "/metrics" {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"not found")));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return resp;
    }

    let mut resp = Response::new(Full::new(Bytes::from(handle.render())));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    resp
}
