use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::env;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{OrchestratorError, OrchestratorResult};

const DEFAULT_FILTER: &str = "microvm_orchestrator=info";

/// Initialize tracing for a process role (`agent` or `control-plane`).
///
/// OTLP export is on unless `OTEL_ENABLED=false`; `LOG_FORMAT=json` switches
/// the plain subscriber to JSON lines.
pub fn init_tracing(role: &str) -> OrchestratorResult<()> {
    let service_name =
        env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| format!("microvm-{role}"));
    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let enabled = env::var("OTEL_ENABLED")
        .unwrap_or_else(|_| "true".to_string())
        .parse::<bool>()
        .unwrap_or(true);

    if !enabled {
        return init_basic_tracing();
    }

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| OrchestratorError::Internal(format!("Failed to create exporter: {e}")))?;

    let tracer_provider = trace::TracerProvider::builder()
        .with_resource(Resource::new(vec![
            opentelemetry::KeyValue::new(SERVICE_NAME, service_name.clone()),
            opentelemetry::KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]))
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("microvm-orchestrator"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .try_init()
        .map_err(|e| OrchestratorError::Internal(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(
        service = service_name,
        endpoint = endpoint,
        "OpenTelemetry tracing initialized"
    );

    Ok(())
}

fn init_basic_tracing() -> OrchestratorResult<()> {
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_FILTER.into()),
    );

    let result = if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| OrchestratorError::Internal(format!("Failed to install subscriber: {e}")))
}

/// Flush pending spans before exit.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_basic_tracing() {
        // SAFETY: serialized with the other env-mutating tests.
        unsafe { env::set_var("OTEL_ENABLED", "false") };
        // A second test binary may already own the global subscriber.
        let _ = init_tracing("agent");
        // SAFETY: as above.
        unsafe { env::remove_var("OTEL_ENABLED") };
    }
}
