//! # Telemetry Features
//!
//! Console logging is always on. Everything else is optional and exported
//! via OpenTelemetry to Honeycomb and/or stdout.
//!
//! ## Feature matrix
//!
//! - `tracing`: Enables OpenTelemetry distributed tracing (via spans), and the
//!   pool's own lifecycle events.
//! - `metrics`: Enables OpenTelemetry metrics for the pool and HTTP layer.
//! - `honeycomb`: Enables the Honeycomb OTLP exporter.
//! - `stdout`: Enables the stdout OTLP exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require using at least one of: `tracing` or `metrics`.
//! - Both `honeycomb` and `stdout` exporters can be enabled at the same time.
//!
//! ## Metrics
//!
//! [`Metrics`] is handed to the pool as its [`PoolObserver`] and to the HTTP
//! layer for request latency. It records:
//!
//! - `decrypter_pool_queued_operations`: items waiting for a worker (gauge)
//! - `decrypter_match_time`: verifier time, by `ismatch` (histogram, seconds)
//! - `requests` / `request_errors`: pool submissions and failed submissions
//! - `http_request_duration`: HTTP latency, by `path` (histogram, seconds)
//!
//! Without the `metrics` feature every recording method is a no-op.
//!
//! ## Example usage
//!
//! Enable tracing and metrics, exported to stdout:
//!
//! ```bash
//! cargo run -p decrypter-server --features tracing,metrics,stdout
//! ```

// Disallow using `honeycomb` without `tracing` or `metrics`
#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

// Disallow using `stdout` without `tracing` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

// Core imports - always needed
use core::time::Duration;
use decrypter::PoolObserver;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Honeycomb-specific imports
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use tonic::transport::ClientTlsConfig;

// Metrics-specific imports
#[cfg(feature = "metrics")]
use decrypter::{Error, Verdict};
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;

// Either
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

// Tracing-specific imports
#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
    pub metrics: Arc<Metrics>,
}

impl TelemetryProviders {
    /// Flushes and shuts down every enabled exporter.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
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

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("decrypter")
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

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let (registry, metrics) = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        let metrics = Metrics::from_meter(&meter);

        (
            registry.with(tracing_opentelemetry::MetricsLayer::new(
                meter_provider.clone(),
            )),
            metrics,
        )
    };

    #[cfg(not(feature = "metrics"))]
    let metrics = Metrics::default();

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
        metrics: Arc::new(metrics),
    })
}

/// How often buffered spans and metric points are pushed to exporters.
#[cfg(any(feature = "metrics", feature = "tracing"))]
const EXPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Spans buffered before the batch processor starts dropping them.
#[cfg(feature = "tracing")]
const SPAN_QUEUE_SIZE: usize = 2048;

#[cfg(feature = "honeycomb")]
const HONEYCOMB_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the Honeycomb OTLP endpoint, read from the
/// environment once per exporter.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    endpoint: String,
    compression: Compression,
    metadata: MetadataMap,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("HONEYCOMB_API_KEY is not a valid header value")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("HONEYCOMB_DATASET is not a valid header value")?,
        );

        let compression = var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase();
        Ok(Self {
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression: Compression::from_str(&compression)?,
            metadata,
        })
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    let version = KeyValue::new(semvcns::resource::SERVICE_VERSION, env!("CARGO_PKG_VERSION"));
    Resource::builder()
        .with_service_name("decrypter")
        .with_schema_url([version], semvcns::SCHEMA_URL)
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(EXPORT_INTERVAL)
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let hc = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(hc.metadata)
            .with_compression(hc.compression)
            .with_endpoint(hc.endpoint)
            .with_timeout(HONEYCOMB_TIMEOUT)
            .with_protocol(Protocol::Grpc)
            // Honeycomb expects per-interval deltas, not running totals.
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build Honeycomb metric exporter")?;
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(EXPORT_INTERVAL)
            .build();
        builder.with_reader(reader)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn batched<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    let config = sdktrace::BatchConfigBuilder::default()
        .with_scheduled_delay(EXPORT_INTERVAL)
        .with_max_queue_size(SPAN_QUEUE_SIZE)
        .build();
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(config)
        .build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder =
        builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let hc = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(hc.metadata)
            .with_compression(hc.compression)
            .with_endpoint(hc.endpoint)
            .with_timeout(HONEYCOMB_TIMEOUT)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build Honeycomb span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

/// Metric handles for the pool and the HTTP layer.
///
/// Owned by the process and passed explicitly to whoever records; nothing is
/// registered globally. `Metrics::default()` records nothing.
#[derive(Default)]
pub struct Metrics {
    #[cfg(feature = "metrics")]
    instruments: Option<Instruments>,
}

#[cfg(feature = "metrics")]
struct Instruments {
    queued: Gauge<u64>,
    match_time: Histogram<f64>,
    requests: Counter<u64>,
    request_errors: Counter<u64>,
    http_duration: Histogram<f64>,
}

#[cfg(feature = "metrics")]
impl Metrics {
    fn from_meter(meter: &Meter) -> Self {
        let instruments = Instruments {
            queued: meter
                .u64_gauge("decrypter_pool_queued_operations")
                .with_description("Verifications waiting for a pool worker")
                .build(),
            match_time: meter
                .f64_histogram("decrypter_match_time")
                .with_unit("s")
                .with_description("Time spent inside the verifier")
                .build(),
            requests: meter
                .u64_counter("requests")
                .with_description("Total verification submissions")
                .build(),
            request_errors: meter
                .u64_counter("request_errors")
                .with_description("Submissions that returned no verdict")
                .build(),
            http_duration: meter
                .f64_histogram("http_request_duration")
                .with_unit("s")
                .with_description("End-to-end HTTP request duration")
                .build(),
        };
        Self {
            instruments: Some(instruments),
        }
    }

    pub fn record_http_request(&self, path: &str, status: u16, elapsed: Duration) {
        if let Some(m) = &self.instruments {
            m.http_duration.record(
                elapsed.as_secs_f64(),
                &[
                    KeyValue::new("path", path.to_string()),
                    KeyValue::new("status", i64::from(status)),
                ],
            );
        }
    }
}

#[cfg(not(feature = "metrics"))]
impl Metrics {
    pub fn record_http_request(&self, _path: &str, _status: u16, _elapsed: Duration) {}
}

#[cfg(feature = "metrics")]
impl PoolObserver for Metrics {
    fn on_enqueue(&self, queued: usize) {
        if let Some(m) = &self.instruments {
            m.queued.record(queued as u64, &[]);
        }
    }

    fn on_dequeue(&self, queued: usize) {
        if let Some(m) = &self.instruments {
            m.queued.record(queued as u64, &[]);
        }
    }

    fn on_verified(&self, verdict: &Verdict, elapsed: Duration) {
        if let Some(m) = &self.instruments {
            m.match_time.record(
                elapsed.as_secs_f64(),
                &[KeyValue::new("ismatch", verdict.label())],
            );
        }
    }

    fn on_submit(&self, result: &Result<Verdict, Error>, _elapsed: Duration) {
        if let Some(m) = &self.instruments {
            m.requests.add(1, &[]);
            if result.is_err() {
                m.request_errors.add(1, &[]);
            }
        }
    }
}

#[cfg(not(feature = "metrics"))]
impl PoolObserver for Metrics {}
