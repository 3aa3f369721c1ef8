//! Prometheus metrics for the gateway

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

/// Completions processed, by source and outcome
pub static COMPLETION_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gateway_completions_total",
        "Completions processed",
        &["source", "status"]
    )
    .expect("metric registration")
});

/// Wall-clock time of one provider inference call
pub static INFERENCE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_provider_inference_seconds",
        "Provider inference duration",
        &["provider", "model"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("metric registration")
});

/// Time spent materializing files before a provider call
pub static FILE_DOWNLOAD_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_file_download_seconds",
        "File materialization duration",
        &["provider"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("metric registration")
});

/// Remaining quota advertised by provider rate-limit headers
pub static RATE_LIMIT_REMAINING: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "gateway_provider_rate_limit_remaining",
        "Remaining quota advertised by the provider",
        &["provider", "kind"]
    )
    .expect("metric registration")
});

/// Cache lookups for completion reuse
pub static CACHE_LOOKUPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gateway_completion_cache_lookups_total",
        "Completion cache lookups",
        &["outcome"]
    )
    .expect("metric registration")
});

/// Record a rate-limit header observation. Values are informational only and
/// never influence routing.
pub fn observe_rate_limit(provider: &str, kind: &str, remaining: f64) {
    RATE_LIMIT_REMAINING
        .with_label_values(&[provider, kind])
        .set(remaining);
}

/// Render the default registry in the text exposition format
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!("failed to encode metrics: {e}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
