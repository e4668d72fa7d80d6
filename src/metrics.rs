use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("crawl_pages_total", "Listing pages rendered and parsed.");
        describe_counter!(
            "crawl_items_total",
            "Items processed, labelled by outcome (analyzed, cached, failed)."
        );
        describe_counter!(
            "pool_handles_created_total",
            "Browser handles launched, labelled by construction tier."
        );
        describe_gauge!("pool_outstanding", "Browser handles currently leased.");
        describe_counter!(
            "pool_exhausted_total",
            "Acquires that failed because every construction tier failed."
        );
        describe_counter!(
            "analysis_calls_total",
            "Inference calls issued, labelled by category."
        );
        describe_counter!(
            "analysis_retries_total",
            "Inference calls retried after a service failure."
        );
        describe_counter!(
            "analysis_reasks_total",
            "Strict re-asks after unparseable model output."
        );
        describe_histogram!("run_duration_ms", "Multi-source run wall time in milliseconds.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the crawler's series.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
