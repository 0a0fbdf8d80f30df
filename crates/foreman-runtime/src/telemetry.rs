//! Logging and trace-export setup.
//!
//! Call [`init_tracing`] once at process startup and keep the returned guard
//! alive until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `FOREMAN_LOG_FORMAT` | `json` for newline-delimited JSON, anything else for compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector base URL.  When set, spans are exported. |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const TRACER_NAME: &str = "foreman";

/// Console log encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("FOREMAN_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Install the global `tracing` subscriber.
///
/// A second call leaves the first subscriber in place.  The OTLP exporter
/// uses the simple (synchronous) span processor, so no Tokio runtime has to
/// exist yet.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_env();
    let provider = build_provider(service_name);

    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(TRACER_NAME))
    });
    let json_layer = (format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json());
    let compact_layer =
        (format == LogFormat::Compact).then(|| tracing_subscriber::fmt::layer().compact());

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed; keeping it");
    }

    TracerProviderGuard(provider)
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts the span exporter down, flushing pending spans, when dropped.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// Whether spans are being exported.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[foreman] trace exporter shutdown error: {e}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.trim().is_empty() {
        return None;
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[foreman] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Compact);
        assert_eq!(LogFormat::parse(None), LogFormat::Compact);
    }

    #[test]
    fn no_endpoint_means_no_exporter() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("foreman-test").is_none());
    }

    #[test]
    fn init_twice_does_not_panic() {
        let first = init_tracing("foreman-test");
        let second = init_tracing("foreman-test");
        drop(second);
        drop(first);
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        let guard = TracerProviderGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }
}
