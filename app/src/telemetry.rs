use crate::config::TelemetryConfig;
use anyhow::{Context, Result};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialize the tracing subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    let subscriber = match config.log_format.as_str() {
        "json" => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true);

            subscriber.with(fmt_layer.boxed())
        }
        _ => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE);

            subscriber.with(fmt_layer.boxed())
        }
    };

    subscriber
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!(
        "Telemetry initialized - service: {}, environment: {}, log_level: {}",
        config.service_name,
        config.environment,
        config.log_level
    );

    Ok(())
}
