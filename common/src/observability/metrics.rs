//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` per process. Pipeline stages hold an
//! `Option<MetricsContext>` so unit tests can run without a registry.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Hot-path instrumentation is a counter increment or a gauge set.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // RTP counters
    pub rtp_received_total: IntCounter,
    pub rtp_forwarded_total: IntCounter,
    pub rtp_dropped_total: IntCounter,
    pub rtx_recovered_total: IntCounter,
    pub rtx_served_total: IntCounter,

    // RTCP counters
    pub nacks_sent_total: IntCounter,
    pub plis_sent_total: IntCounter,
    pub rembs_sent_total: IntCounter,
    pub rtcp_parsed_total: IntCounterVec,
    pub rtcp_malformed_total: IntCounter,

    /// Items dropped because a bounded queue was full
    pub channel_full_drops_total: IntCounter,

    // Gauges
    pub sorted_store_packets: IntGauge,
    pub video_bitrate_bps: IntGauge,
    pub buffer_window_ms: IntGauge,

    /// RFC 3550 interarrival jitter (seconds)
    pub interarrival_jitter_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("rtp_sfu".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let rtp_received_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_received_total",
            "Total RTP packets received",
        ))?;
        let rtp_forwarded_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_forwarded_total",
            "Total RTP packets released by a jitter buffer",
        ))?;
        let rtp_dropped_total = IntCounter::with_opts(Opts::new(
            "rtp_packets_dropped_total",
            "Total RTP packets dropped (late, duplicate, not a key frame)",
        ))?;
        let rtx_recovered_total = IntCounter::with_opts(Opts::new(
            "rtx_packets_recovered_total",
            "Total RTX packets unwrapped into the publisher buffer",
        ))?;
        let rtx_served_total = IntCounter::with_opts(Opts::new(
            "rtx_packets_served_total",
            "Total RTX packets sent in answer to a NACK",
        ))?;

        let nacks_sent_total =
            IntCounter::with_opts(Opts::new("rtcp_nacks_sent_total", "Total NACKs sent"))?;
        let plis_sent_total =
            IntCounter::with_opts(Opts::new("rtcp_plis_sent_total", "Total PLIs sent"))?;
        let rembs_sent_total =
            IntCounter::with_opts(Opts::new("rtcp_rembs_sent_total", "Total REMBs sent"))?;
        let rtcp_parsed_total = IntCounterVec::new(
            Opts::new("rtcp_packets_parsed_total", "RTCP packets parsed, by kind"),
            &["kind"],
        )?;
        let rtcp_malformed_total = IntCounter::with_opts(Opts::new(
            "rtcp_packets_malformed_total",
            "RTCP datagrams that failed to parse",
        ))?;

        let channel_full_drops_total = IntCounter::with_opts(Opts::new(
            "channel_full_drops_total",
            "Items dropped because a pipeline queue was full",
        ))?;

        let sorted_store_packets = IntGauge::with_opts(Opts::new(
            "sorted_store_packets",
            "Packets currently held by the publisher sorted store",
        ))?;
        let video_bitrate_bps = IntGauge::with_opts(Opts::new(
            "video_bitrate_bps",
            "Current target video bitrate (bits/s)",
        ))?;
        let buffer_window_ms = IntGauge::with_opts(Opts::new(
            "buffer_window_ms",
            "Current jitter buffer window (ms)",
        ))?;

        let interarrival_jitter_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "interarrival_jitter_seconds",
                "RFC 3550 interarrival jitter per receiver report (seconds)",
            )
            .buckets(vec![0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5]),
        )?;

        // Register all metrics
        registry.register(Box::new(rtp_received_total.clone()))?;
        registry.register(Box::new(rtp_forwarded_total.clone()))?;
        registry.register(Box::new(rtp_dropped_total.clone()))?;
        registry.register(Box::new(rtx_recovered_total.clone()))?;
        registry.register(Box::new(rtx_served_total.clone()))?;
        registry.register(Box::new(nacks_sent_total.clone()))?;
        registry.register(Box::new(plis_sent_total.clone()))?;
        registry.register(Box::new(rembs_sent_total.clone()))?;
        registry.register(Box::new(rtcp_parsed_total.clone()))?;
        registry.register(Box::new(rtcp_malformed_total.clone()))?;
        registry.register(Box::new(channel_full_drops_total.clone()))?;
        registry.register(Box::new(sorted_store_packets.clone()))?;
        registry.register(Box::new(video_bitrate_bps.clone()))?;
        registry.register(Box::new(buffer_window_ms.clone()))?;
        registry.register(Box::new(interarrival_jitter_seconds.clone()))?;

        Ok(Self {
            registry,
            rtp_received_total,
            rtp_forwarded_total,
            rtp_dropped_total,
            rtx_recovered_total,
            rtx_served_total,
            nacks_sent_total,
            plis_sent_total,
            rembs_sent_total,
            rtcp_parsed_total,
            rtcp_malformed_total,
            channel_full_drops_total,
            sorted_store_packets,
            video_bitrate_bps,
            buffer_window_ms,
            interarrival_jitter_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}
