//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter, optional JSON output and,
//! when the `metrics` feature is enabled, an OpenTelemetry export layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the telemetry pipeline alive; flushes it on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::MetricsGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "metrics")]
        if let Some(guard) = self.metrics.take()
            && let Err(e) = guard.shutdown()
        {
            tracing::warn!(error = %e, "OpenTelemetry shutdown failed");
        }
    }
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"warmpool_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter(default_filter));
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Initialise tracing and, if `metrics_endpoint` is set (and the `metrics`
/// feature compiled in), export spans and metrics over OTLP.
///
/// Falls back to plain logging when the exporter cannot be built.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    #[cfg(feature = "metrics")]
    if let Some(endpoint) = metrics_endpoint {
        match crate::metrics::init_metrics(endpoint) {
            Ok(guard) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(guard.tracer());
                let registry = tracing_subscriber::registry()
                    .with(env_filter(default_filter))
                    .with(otel_layer);
                if log_json {
                    registry
                        .with(tracing_subscriber::fmt::layer().json())
                        .init();
                } else {
                    registry.with(tracing_subscriber::fmt::layer()).init();
                }
                tracing::info!(endpoint, "OpenTelemetry export enabled");
                return TelemetryGuard {
                    metrics: Some(guard),
                };
            }
            Err(e) => {
                init_tracing(default_filter, log_json);
                tracing::warn!(error = %e, endpoint, "OpenTelemetry disabled");
                return TelemetryGuard::default();
            }
        }
    }

    init_tracing(default_filter, log_json);
    TelemetryGuard::default()
}
