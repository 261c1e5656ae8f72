//! Observability module for metrics
//!
//! OpenTelemetry counters and histograms for request handling, loop steps,
//! and upstream calls. Metrics export over OTLP when
//! OTEL_EXPORTER_OTLP_ENDPOINT is set and stay local otherwise.

use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::sync::OnceLock;
use std::time::Instant;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Delver metrics for the request and research pipeline
pub struct Metrics {
    /// Chat requests started
    pub requests_started: Counter<u64>,
    /// Chat requests completed, by outcome
    pub requests_completed: Counter<u64>,
    /// Request duration in seconds
    pub request_duration_seconds: Histogram<f64>,
    /// Loop steps executed
    pub loop_steps: Counter<u64>,
    /// Searches executed, by result bucket
    pub searches: Counter<u64>,
    /// LLM calls, by stage
    pub llm_calls: Counter<u64>,
    /// Tokens consumed, by stage
    pub llm_tokens: Counter<u64>,
    /// Requests blocked by the rate limiter
    pub rate_limited: Counter<u64>,
}

impl Metrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests_started: meter
                .u64_counter("delver_requests_started_total")
                .with_description("Chat requests started")
                .with_unit("requests")
                .build(),
            requests_completed: meter
                .u64_counter("delver_requests_completed_total")
                .with_description("Chat requests completed")
                .with_unit("requests")
                .build(),
            request_duration_seconds: meter
                .f64_histogram("delver_request_duration_seconds")
                .with_description("Duration of chat request handling")
                .with_unit("s")
                .build(),
            loop_steps: meter
                .u64_counter("delver_loop_steps_total")
                .with_description("Agent loop steps executed")
                .with_unit("steps")
                .build(),
            searches: meter
                .u64_counter("delver_searches_total")
                .with_description("Web searches executed")
                .with_unit("searches")
                .build(),
            llm_calls: meter
                .u64_counter("delver_llm_calls_total")
                .with_description("Model gateway calls")
                .with_unit("calls")
                .build(),
            llm_tokens: meter
                .u64_counter("delver_llm_tokens_total")
                .with_description("Tokens consumed across gateway calls")
                .with_unit("tokens")
                .build(),
            rate_limited: meter
                .u64_counter("delver_rate_limited_total")
                .with_description("Requests blocked by the rate limiter")
                .with_unit("requests")
                .build(),
        }
    }

    pub fn record_request_started(&self) {
        self.requests_started.add(1, &[]);
    }

    pub fn record_request_completed(&self, outcome: &str, duration: f64) {
        let attrs = &[KeyValue::new("outcome", outcome.to_string())];
        self.requests_completed.add(1, attrs);
        self.request_duration_seconds.record(duration, attrs);
    }

    pub fn record_loop_step(&self) {
        self.loop_steps.add(1, &[]);
    }

    pub fn record_search(&self, result_count: usize) {
        let bucket = if result_count == 0 { "empty" } else { "nonempty" };
        self.searches
            .add(1, &[KeyValue::new("results", bucket.to_string())]);
    }

    pub fn record_llm_call(&self, stage: &str, total_tokens: u64) {
        let attrs = &[KeyValue::new("stage", stage.to_string())];
        self.llm_calls.add(1, attrs);
        self.llm_tokens.add(total_tokens, attrs);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.add(1, &[]);
    }
}

/// Configuration for observability
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Service name
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            service_name: "delver".to_string(),
        }
    }
}

/// Initialize observability with optional OTLP export
pub fn init(config: ObservabilityConfig) -> crate::Result<()> {
    let meter_provider = if let Some(endpoint) = &config.otlp_endpoint {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::metrics::PeriodicReader;
        use opentelemetry_sdk::runtime;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| crate::Error::Configuration(format!("OTLP exporter: {e}")))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio)
            .with_interval(std::time::Duration::from_secs(30))
            .build();

        SdkMeterProvider::builder().with_reader(reader).build()
    } else {
        tracing::info!("OTEL_EXPORTER_OTLP_ENDPOINT not set, metrics will be logged only");
        SdkMeterProvider::builder().build()
    };

    let meter = meter_provider.meter("delver");
    let metrics = Metrics::new(&meter);

    METRICS
        .set(metrics)
        .map_err(|_| crate::Error::Configuration("Metrics already initialized".into()))?;

    tracing::info!(
        otlp_endpoint = ?config.otlp_endpoint,
        "Observability initialized"
    );

    Ok(())
}

/// Get global metrics instance
///
/// Returns None until `init()` has run.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Helper to time a request and record its outcome
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        if let Some(m) = metrics() {
            m.record_request_started();
        }
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self, outcome: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        if let Some(m) = metrics() {
            m.record_request_completed(outcome, duration);
        }
        tracing::info!(outcome, duration_seconds = duration, "Request completed");
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
