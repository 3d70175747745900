//! Tracing setup: console logs plus optional OpenTelemetry export
//!
//! Every agent task opens an `agent_task` span carrying its `trace_id`;
//! `llm_call` and `tool_call` spans nest under it. With an OTLP endpoint
//! configured those spans are exported to a collector:
//!
//! ```text
//! neurosurf → OTLP (gRPC) → OTel Collector → Tempo (traces)
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,neurosurf=debug";

pub type TracingError = Box<dyn std::error::Error + Send + Sync>;

/// Initialize logging, and OTLP trace export when an endpoint is configured
///
/// # Example
/// ```ignore
/// init_tracing(&config.telemetry)?;
/// ```
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TracingError> {
    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", config.service_name.clone()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    // one of these two is installed
    let (plain_layer, json_layer) = if config.json_logs {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service = %config.service_name,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "Tracing initialized"
    );

    Ok(())
}

/// Console logging only, with default settings
pub fn init_console_tracing() -> Result<(), TracingError> {
    init_tracing(&TelemetryConfig::default())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("Tracing shutdown complete");
}

/// Log with trace context
///
/// Automatically includes trace_id in structured log output
#[macro_export]
macro_rules! trace_log {
    ($level:ident, $trace_id:expr, $($arg:tt)*) => {
        tracing::$level!(trace_id = %$trace_id, $($arg)*)
    };
}
