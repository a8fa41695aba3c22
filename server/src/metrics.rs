//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Global metrics instance
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub sessions_total: IntCounter,
    pub auth_failures: IntCounter,
    pub header_errors: IntCounter,
    pub dial_failures: IntCounter,
    pub bytes_client_to_remote: IntCounter,
    pub bytes_remote_to_client: IntCounter,

    // Gauges
    pub active_sessions: IntGauge,

    // Histograms
    pub chunk_size: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let sessions_total = IntCounter::with_opts(Opts::new(
            "veil_sessions_total",
            "Total number of relay sessions accepted",
        ))
        .unwrap();

        let auth_failures = IntCounter::with_opts(Opts::new(
            "veil_auth_failures_total",
            "Total sessions rejected for a user ID mismatch",
        ))
        .unwrap();

        let header_errors = IntCounter::with_opts(Opts::new(
            "veil_header_errors_total",
            "Total sessions rejected for an undecodable request header",
        ))
        .unwrap();

        let dial_failures = IntCounter::with_opts(Opts::new(
            "veil_dial_failures_total",
            "Total outbound connection attempts that failed",
        ))
        .unwrap();

        let bytes_client_to_remote = IntCounter::with_opts(Opts::new(
            "veil_bytes_client_to_remote_total",
            "Bytes forwarded from clients to destinations",
        ))
        .unwrap();

        let bytes_remote_to_client = IntCounter::with_opts(Opts::new(
            "veil_bytes_remote_to_client_total",
            "Bytes forwarded from destinations to clients",
        ))
        .unwrap();

        let active_sessions = IntGauge::with_opts(Opts::new(
            "veil_active_sessions",
            "Number of live relay sessions",
        ))
        .unwrap();

        let chunk_size = Histogram::with_opts(
            HistogramOpts::new(
                "veil_chunk_size_bytes",
                "Size of chunks forwarded toward clients",
            )
            .buckets(vec![64.0, 256.0, 512.0, 1024.0, 4096.0, 8192.0, 16384.0]),
        )
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(sessions_total.clone())).ok();
        REGISTRY.register(Box::new(auth_failures.clone())).ok();
        REGISTRY.register(Box::new(header_errors.clone())).ok();
        REGISTRY.register(Box::new(dial_failures.clone())).ok();
        REGISTRY
            .register(Box::new(bytes_client_to_remote.clone()))
            .ok();
        REGISTRY
            .register(Box::new(bytes_remote_to_client.clone()))
            .ok();
        REGISTRY.register(Box::new(active_sessions.clone())).ok();
        REGISTRY.register(Box::new(chunk_size.clone())).ok();

        Self {
            sessions_total,
            auth_failures,
            header_errors,
            dial_failures,
            bytes_client_to_remote,
            bytes_remote_to_client,
            active_sessions,
            chunk_size,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    use prometheus::Encoder;

                    let encoder = prometheus::TextEncoder::new();
                    let mut buffer = Vec::new();
                    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .header("Content-Type", "text/plain")
                            .body(Full::new(Bytes::from(buffer)))
                            .unwrap(),
                    )
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}
