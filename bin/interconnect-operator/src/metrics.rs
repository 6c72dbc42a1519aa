//! Prometheus metrics for the operator and the HTTP endpoint serving them

use anyhow::Result;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Operator metrics, cheap to clone
#[derive(Clone)]
pub struct Metrics {
    /// Reconciliation passes by result (success, error)
    pub reconciliations_total: CounterVec,
    /// Wall time of a reconciliation pass
    pub reconcile_duration_seconds: Histogram,
    /// Workload kind transitions started
    pub workload_transitions_total: Counter,
    /// Mutating calls by object kind and operation
    pub object_writes_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconciliations_total = CounterVec::new(
            Opts::new(
                "interconnect_reconciliations_total",
                "Interconnect reconciliation passes",
            ),
            &["result"],
        )?;

        let reconcile_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "interconnect_reconcile_duration_seconds",
            "Interconnect reconciliation pass latency in seconds",
        ))?;

        let workload_transitions_total = Counter::new(
            "interconnect_workload_transitions_total",
            "Workload kind transitions started",
        )?;

        let object_writes_total = CounterVec::new(
            Opts::new(
                "interconnect_object_writes_total",
                "Mutating cluster API calls issued",
            ),
            &["kind", "op"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(workload_transitions_total.clone()))?;
        registry.register(Box::new(object_writes_total.clone()))?;

        Ok(Self {
            reconciliations_total,
            reconcile_duration_seconds,
            workload_transitions_total,
            object_writes_total,
            registry,
        })
    }

    pub fn record_reconcile(&self, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconciliations_total.with_label_values(&[result]).inc();
        self.reconcile_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_write(&self, kind: &str, op: &str) {
        self.object_writes_total.with_label_values(&[kind, op]).inc();
    }

    pub fn record_transition(&self) {
        self.workload_transitions_total.inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Serve /metrics and /healthz until the listener fails
pub async fn serve(addr: SocketAddr, metrics: Metrics) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, hyper::Error>(handle_request(&req, &metrics)) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving metrics connection from {}: {}", peer_addr, e);
            }
        });
    }
}

fn handle_request<B>(req: &Request<B>, metrics: &Metrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => match metrics.gather() {
            Ok(text) => text_response(StatusCode::OK, text),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to gather metrics\n".to_string(),
                )
            }
        },
        "/healthz" => text_response(StatusCode::OK, "OK\n".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
