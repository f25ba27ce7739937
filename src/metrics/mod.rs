//! Prometheus metrics for the storage core.
//!
//! All collectors belong to one [`StorageMetrics`] value that owns its own
//! [`Registry`]. It is built once at process start and shared by `Arc` with
//! every component that records measurements, so tests and embedded users
//! can run several independent instances side by side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::Error;
use crate::MonitoringConfig;
use crate::Result;

const METRICS_NAMESPACE: &str = "apistore";

#[derive(Clone)]
pub struct StorageMetrics {
    registry: Registry,

    pub(crate) watch_cache_events: IntCounterVec,
    pub(crate) watch_cache_evictions: IntCounterVec,
    pub(crate) watch_cache_too_old: IntCounterVec,
    pub(crate) watch_cache_fresh_timeouts: IntCounterVec,
    pub(crate) watch_cache_resource_version: IntGaugeVec,
    pub(crate) watch_cache_replaces: IntCounterVec,

    pub(crate) watchers_active: IntGaugeVec,
    pub(crate) watchers_terminated: IntCounterVec,
    pub(crate) watch_init_events: IntCounterVec,

    pub(crate) guaranteed_update_conflicts: IntCounterVec,

    pub(crate) transform_operations: IntCounterVec,
    pub(crate) dek_cache_lookups: IntCounterVec,
    pub(crate) kms_latency: HistogramVec,
}

impl std::fmt::Debug for StorageMetrics {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StorageMetrics").finish_non_exhaustive()
    }
}

impl StorageMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(METRICS_NAMESPACE.to_string()), None)?;

        let metrics = Self {
            watch_cache_events: IntCounterVec::new(
                Opts::new("watch_cache_events_total", "Events appended to the watch cache"),
                &["resource", "type"],
            )?,
            watch_cache_evictions: IntCounterVec::new(
                Opts::new(
                    "watch_cache_evictions_total",
                    "Events evicted from a full watch cache window",
                ),
                &["resource"],
            )?,
            watch_cache_too_old: IntCounterVec::new(
                Opts::new(
                    "watch_cache_too_old_total",
                    "Requests for history older than the watch cache window",
                ),
                &["resource"],
            )?,
            watch_cache_fresh_timeouts: IntCounterVec::new(
                Opts::new(
                    "watch_cache_fresh_timeouts_total",
                    "Reads that timed out waiting for the watch cache to catch up",
                ),
                &["resource"],
            )?,
            watch_cache_resource_version: IntGaugeVec::new(
                Opts::new(
                    "watch_cache_resource_version",
                    "Highest resource version incorporated by the watch cache",
                ),
                &["resource"],
            )?,
            watch_cache_replaces: IntCounterVec::new(
                Opts::new("watch_cache_replaces_total", "Full watch cache resyncs"),
                &["resource"],
            )?,
            watchers_active: IntGaugeVec::new(
                Opts::new("watchers_active", "Watchers currently registered"),
                &["resource"],
            )?,
            watchers_terminated: IntCounterVec::new(
                Opts::new(
                    "watchers_terminated_total",
                    "Watchers closed because they could not keep up",
                ),
                &["resource"],
            )?,
            watch_init_events: IntCounterVec::new(
                Opts::new(
                    "watch_init_events_total",
                    "Events replayed to watchers when they start",
                ),
                &["resource"],
            )?,
            guaranteed_update_conflicts: IntCounterVec::new(
                Opts::new(
                    "guaranteed_update_conflicts_total",
                    "Compare-and-swap conflicts observed by guaranteed updates",
                ),
                &["resource"],
            )?,
            transform_operations: IntCounterVec::new(
                Opts::new(
                    "transform_operations_total",
                    "Value transformations by transformer, direction and outcome",
                ),
                &["transformer", "operation", "status"],
            )?,
            dek_cache_lookups: IntCounterVec::new(
                Opts::new(
                    "dek_cache_lookups_total",
                    "Data encryption key cache lookups by result",
                ),
                &["result"],
            )?,
            kms_latency: HistogramVec::new(
                HistogramOpts::new("kms_operation_duration_ms", "KMS call latency in ms")
                    .buckets(exponential_buckets(0.5, 2.0, 14)?),
                &["operation"],
            )?,
            registry,
        };

        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> Result<()> {
        self.registry.register(Box::new(self.watch_cache_events.clone()))?;
        self.registry.register(Box::new(self.watch_cache_evictions.clone()))?;
        self.registry.register(Box::new(self.watch_cache_too_old.clone()))?;
        self.registry.register(Box::new(self.watch_cache_fresh_timeouts.clone()))?;
        self.registry.register(Box::new(self.watch_cache_resource_version.clone()))?;
        self.registry.register(Box::new(self.watch_cache_replaces.clone()))?;
        self.registry.register(Box::new(self.watchers_active.clone()))?;
        self.registry.register(Box::new(self.watchers_terminated.clone()))?;
        self.registry.register(Box::new(self.watch_init_events.clone()))?;
        self.registry.register(Box::new(self.guaranteed_update_conflicts.clone()))?;
        self.registry.register(Box::new(self.transform_operations.clone()))?;
        self.registry.register(Box::new(self.dek_cache_lookups.clone()))?;
        self.registry.register(Box::new(self.kms_latency.clone()))?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every collector
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Fatal(format!("metrics are not utf-8: {e}")))
    }

    pub(crate) fn record_transform(
        &self,
        transformer: &str,
        operation: &str,
        success: bool,
    ) {
        let status = if success { "ok" } else { "error" };
        self.transform_operations.with_label_values(&[transformer, operation, status]).inc();
    }

    pub(crate) fn record_kms_latency(
        &self,
        operation: &str,
        elapsed: Duration,
    ) {
        self.kms_latency
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64() * 1000.0);
    }
}

/// `GET /metrics` filter serving the text exposition of `metrics`.
pub fn metrics_route(
    metrics: Arc<StorageMetrics>
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("metrics").and(warp::get()).map(move || match metrics.encode_text() {
        Ok(body) => warp::reply::with_status(body, StatusCode::OK),
        Err(e) => {
            error!("could not encode metrics: {}", e);
            warp::reply::with_status(String::new(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    })
}

/// Starts the Prometheus endpoint and returns the bound address.
///
/// The server stops when `shutdown` is cancelled.
pub fn serve_metrics(
    metrics: Arc<StorageMetrics>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let (bound, server) = warp::serve(metrics_route(metrics))
        .try_bind_with_graceful_shutdown(addr, async move {
            shutdown.cancelled().await;
        })
        .map_err(|e| Error::Fatal(format!("failed to bind metrics endpoint {addr}: {e}")))?;

    info!("metrics endpoint listening on {}", bound);
    Ok((bound, tokio::spawn(server)))
}

/// [`serve_metrics`] driven by the `monitoring` config section; `None` when
/// the endpoint is disabled.
pub fn serve_metrics_from_config(
    metrics: Arc<StorageMetrics>,
    config: &MonitoringConfig,
    shutdown: CancellationToken,
) -> Result<Option<(SocketAddr, JoinHandle<()>)>> {
    if !config.enabled {
        return Ok(None);
    }
    serve_metrics(metrics, config.socket_addr()?, shutdown).map(Some)
}
