//! # Telemetry Features
//!
//! Console logging through `tracing_subscriber` is always on. On top of it,
//! spans and metrics can be exported via OpenTelemetry to Honeycomb or stdout.
//!
//! ## Feature matrix
//!
//! - `otel`: Enables OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics (via counters, histograms, etc.).
//! - `honeycomb`: Enables the Honeycomb OTLP exporter.
//! - `stdout`: Enables the stdout OTLP exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require using at least one of: `otel` or `metrics`.
//! - Both `honeycomb` and `stdout` exporters can be enabled at the same time.
//!
//! ## Span behavior
//!
//! - Spans created via `tracing::info_span!` are exported to any enabled
//!   telemetry backend
//! - Events (`tracing::info!`, etc.) inside a span become span events in
//!   telemetry backends
//! - Events outside of a span are only shown in log output (via
//!   `fmt::layer()`), not exported
//!
//! ## Metrics behavior
//!
//! - Metrics (request count, queue depth, active handles, requeues) are
//!   exported if `metrics` is enabled
//! - Each exporter (Honeycomb, stdout) gets its own reader
//!
//! ## Example usage
//!
//! Enable tracing and export to Honeycomb:
//!
//! ```bash
//! cargo run --features otel,honeycomb
//! ```
//!
//! Enable metrics and export to Honeycomb:
//!
//! ```bash
//! cargo run --features metrics,honeycomb
//! ```
//!
//! Enable tracing and metrics, exported to both Honeycomb and stdout:
//!
//! ```bash
//! cargo run --features otel,metrics,honeycomb,stdout
//! ```
//!
//! Enable only local stdout export (no remote backend):
//!
//! ```bash
//! cargo run --features otel,stdout
//! ```

// Disallow using `honeycomb` without `otel` or `metrics`
#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "otel", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'otel' or 'metrics' to be enabled."
);

// Disallow using `stdout` without `otel` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled."
);

// Core imports - always needed
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Honeycomb-specific imports
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "otel")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "otel")))]
use tonic::transport::ClientTlsConfig;

// Metrics-specific imports
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

// Either
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

// Tracing-specific imports
#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Errors go to stderr since the
    /// subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {:#?}", err);
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {:#?}", err);
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {:#?}", err);
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {:#?}", err);
            }
        }
    }
}

/// Installs the global subscriber for `service_name` and returns the
/// exporter providers, which must be flushed on shutdown.
pub fn init_telemetry(service_name: &'static str) -> anyhow::Result<TelemetryProviders> {
    #[cfg(not(any(feature = "metrics", feature = "otel")))]
    let _ = service_name;

    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer(service_name)?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics(service_name)?;

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(service_name)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Always subscribe to standard tracing logs printed to the console via
    // `tracing_subscriber::fmt`. This is unrelated to the `opentelemetry_stdout`
    // exporter - it logs spans/events as human-readable output.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "honeycomb")]
fn get_metadata() -> anyhow::Result<MetadataMap> {
    use anyhow::Context;

    let mut map = MetadataMap::new();
    let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
    let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
    map.insert(
        "x-honeycomb-team",
        api_key.parse().context("invalid API key")?,
    );
    map.insert(
        "x-honeycomb-dataset",
        dataset.parse().context("invalid dataset")?,
    );
    Ok(map)
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource(service_name: &'static str) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(service_name: &'static str) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let metadata = get_metadata()?;
        let endpoint =
            std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
        let compression = {
            use std::str::FromStr;
            let raw = std::env::var("HONEYCOMB_COMPRESSION")
                .context("missing `HONEYCOMB_COMPRESSION`")?
                .to_ascii_lowercase();
            Compression::from_str(&raw)?
        };
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
fn init_tracer(service_name: &'static str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let metadata = get_metadata()?;
        let endpoint =
            std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
        let compression = {
            use std::str::FromStr;
            let raw = std::env::var("HONEYCOMB_COMPRESSION")
                .context("missing `HONEYCOMB_COMPRESSION`")?
                .to_ascii_lowercase();
            Compression::from_str(&raw)?
        };
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEUES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RETRIES_EXHAUSTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static QUEUE_DEPTH: OnceLock<Gauge<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static HANDLES_ACTIVE: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static HANDLE_RETIREMENTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_SERVICED: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Client requests accepted by the dispatcher")
            .build(),
    );

    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("Time from submission to reply, including retries")
            .build(),
    );

    let _ = REQUEST_ERRORS.set(
        meter
            .u64_counter("request_errors")
            .with_description("Client requests answered with an error")
            .build(),
    );

    let _ = REQUEUES.set(
        meter
            .u64_counter("requeues")
            .with_description("Requests put back on the queue after a failed attempt")
            .build(),
    );

    let _ = RETRIES_EXHAUSTED.set(
        meter
            .u64_counter("retries_exhausted")
            .with_description("Requests failed after reaching the attempt limit")
            .build(),
    );

    let _ = QUEUE_DEPTH.set(
        meter
            .u64_gauge("queue_depth")
            .with_description("Requests waiting on the shared queue")
            .build(),
    );

    let _ = HANDLES_ACTIVE.set(
        meter
            .i64_up_down_counter("handles_active")
            .with_description("Worker handles currently running")
            .build(),
    );

    let _ = HANDLE_RETIREMENTS.set(
        meter
            .u64_counter("handle_retirements")
            .with_description("Worker handles that stopped, by reason")
            .build(),
    );

    let _ = REQUESTS_SERVICED.set(
        meter
            .u64_counter("requests_serviced")
            .with_description("Backend calls that completed successfully")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_requests(operation: &'static str) {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[KeyValue::new("operation", operation)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_operation: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_request_errors() {
    if let Some(counter) = REQUEST_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_request_errors() {}

#[cfg(feature = "metrics")]
pub fn increment_requeues() {
    if let Some(counter) = REQUEUES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requeues() {}

#[cfg(feature = "metrics")]
pub fn record_retries_exhausted() {
    if let Some(counter) = RETRIES_EXHAUSTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_retries_exhausted() {}

#[cfg(feature = "metrics")]
pub fn record_queue_depth(depth: u64) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.record(depth, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_queue_depth(_depth: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_handles_active() {
    if let Some(counter) = HANDLES_ACTIVE.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_handles_active() {}

#[cfg(feature = "metrics")]
pub fn decrement_handles_active() {
    if let Some(counter) = HANDLES_ACTIVE.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_handles_active() {}

#[cfg(feature = "metrics")]
pub fn increment_retirements(reason: &'static str) {
    if let Some(counter) = HANDLE_RETIREMENTS.get() {
        counter.add(1, &[KeyValue::new("reason", reason)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_retirements(_reason: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_serviced() {
    if let Some(counter) = REQUESTS_SERVICED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_serviced() {}
