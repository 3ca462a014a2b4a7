//! Structured logging / tracing setup, grounded on
//! `my-little-soda/src/telemetry.rs`'s `init_telemetry`. Under the
//! `observability` feature, spans are additionally exported via
//! `tracing-opentelemetry` so Gatekeeper runs and orchestrator ticks show up
//! in a trace backend; otherwise this only configures `tracing-subscriber`.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

#[cfg(feature = "observability")]
pub fn init_telemetry(cfg: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg.tracing_enabled {
        use opentelemetry::trace::TracerProvider as _;

        let exporter = opentelemetry_stdout::SpanExporter::default();
        let provider = opentelemetry_sdk::trace::TracerProvider::builder()
            .with_simple_exporter(exporter)
            .build();
        let tracer = provider.tracer("autocoder");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(otel_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init tracing subscriber: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init tracing subscriber: {e}"))?;
    }

    tracing::info!("telemetry initialized");
    Ok(())
}

#[cfg(not(feature = "observability"))]
pub fn init_telemetry(cfg: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing subscriber: {e}"))?;

    tracing::info!("telemetry initialized");
    Ok(())
}

pub fn shutdown_telemetry() {
    tracing::info!("telemetry shutdown complete");
}
