//! # Telemetry
//!
//! Logs always go to the console through `tracing_subscriber::fmt`. The level
//! comes from `LOG_LEVEL` (via [`ServerConfig`]); `RUST_LOG`, when set,
//! replaces it with a full filter directive.
//!
//! ## Feature matrix
//!
//! - `otlp`: additionally exports spans over OTLP/gRPC. The collector
//!   endpoint is read from `OTEL_EXPORTER_OTLP_ENDPOINT` (default
//!   `http://localhost:4317`).
//!
//! Spans created by `#[tracing::instrument]` on the service methods and by the
//! gateway's `TraceLayer` are exported; events outside a span only reach the
//! console.
//!
//! ```bash
//! cargo run -p usergate-server --features otlp
//! ```

use crate::server::config::ServerConfig;
use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[cfg(feature = "otlp")]
use opentelemetry::{InstrumentationScope, KeyValue, trace::TracerProvider};
#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace as sdktrace};
#[cfg(feature = "otlp")]
use opentelemetry_semantic_conventions as semvcns;

/// Exporters that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "otlp")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are printed, since the
    /// logging pipeline itself is going away.
    pub fn shutdown(self) {
        #[cfg(feature = "otlp")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }
    }
}

/// `RUST_LOG` if set, otherwise everything at or above `level`.
fn env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Builds the subscriber described by `config` and installs it for the
/// process. Call once, from the binary.
///
/// # Errors
///
/// Fails if a subscriber is already installed or, with `otlp`, if the span
/// exporter cannot be built.
pub fn init_telemetry(config: &ServerConfig) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otlp")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otlp")]
    let tracer_provider = init_tracer()?;

    let registry = tracing_subscriber::registry()
        .with(env_filter(config.log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otlp")]
    let registry = {
        let scope = InstrumentationScope::builder("usergate")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope))
                .with_error_records_to_exceptions(true),
        )
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otlp")]
        tracer_provider,
    })
}

#[cfg(feature = "otlp")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("usergate")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "otlp")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    use anyhow::Context;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build span exporter")?;

    let batch = sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build();

    Ok(sdktrace::SdkTracerProvider::builder()
        .with_resource(resource())
        .with_span_processor(batch)
        .build())
}
