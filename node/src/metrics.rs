//! # Prometheus Metrics
//!
//! Packaging and mempool metrics, scraped at `/metrics`. Everything lives in
//! a dedicated [`prometheus::Registry`] with the `kiln` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use kiln_protocol::network::EmptyReason;

/// Metric handles for the node. Cheap to clone.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Transactions currently waiting in the mempool.
    pub mempool_depth: IntGauge,
    /// Height of the last block this node committed.
    pub block_height: IntGauge,
    pub blocks_packaged_total: IntCounter,
    pub transactions_packaged_total: IntCounter,
    /// Rounds that produced no block, by reason.
    pub empty_rounds_total: IntCounterVec,
    pub packaging_failures_total: IntCounter,
    pub packaging_latency_seconds: Histogram,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("kiln".into()), None)?;

        let mempool_depth = IntGauge::new(
            "mempool_depth",
            "Transactions currently waiting in the mempool",
        )?;
        registry.register(Box::new(mempool_depth.clone()))?;

        let block_height = IntGauge::new("block_height", "Height of the last committed block")?;
        registry.register(Box::new(block_height.clone()))?;

        let blocks_packaged_total =
            IntCounter::new("blocks_packaged_total", "Blocks assembled by this node")?;
        registry.register(Box::new(blocks_packaged_total.clone()))?;

        let transactions_packaged_total = IntCounter::new(
            "transactions_packaged_total",
            "Transactions included in blocks assembled by this node",
        )?;
        registry.register(Box::new(transactions_packaged_total.clone()))?;

        let empty_rounds_total = IntCounterVec::new(
            Opts::new("empty_rounds_total", "Packaging rounds that produced no block"),
            &["reason"],
        )?;
        registry.register(Box::new(empty_rounds_total.clone()))?;

        let packaging_failures_total = IntCounter::new(
            "packaging_failures_total",
            "Packaging rounds aborted with an error",
        )?;
        registry.register(Box::new(packaging_failures_total.clone()))?;

        let packaging_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "packaging_latency_seconds",
                "Wall time of one packaging round in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        registry.register(Box::new(packaging_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            mempool_depth,
            block_height,
            blocks_packaged_total,
            transactions_packaged_total,
            empty_rounds_total,
            packaging_failures_total,
            packaging_latency_seconds,
        })
    }

    pub fn record_empty(&self, reason: EmptyReason) {
        let label = match reason {
            EmptyReason::InsufficientTime => "insufficient_time",
            EmptyReason::ProtocolUpgrade => "protocol_upgrade",
            EmptyReason::PackagingDisabled => "packaging_disabled",
        };
        self.empty_rounds_total.with_label_values(&[label]).inc();
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
