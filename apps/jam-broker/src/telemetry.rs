use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "jam-broker";

/// Process-wide logging, tracing and metrics setup. Dropping it flushes the
/// OpenTelemetry provider when one was installed.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Must run inside a tokio runtime when `metrics_addr` is set.
    pub fn init(log_filter: Option<&str>, metrics_addr: Option<SocketAddr>) -> Result<Self> {
        if let Some(addr) = metrics_addr {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("failed to install Prometheus exporter")?;
        }

        let filter = match log_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .with_context(|| format!("invalid log filter: {directives}"))?,
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };

        let tracer_provider = env_truthy("JAM_BROKER_OTEL_STDOUT").then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(provider) = &tracer_provider {
            global::set_tracer_provider(provider.clone());
            info!("OpenTelemetry stdout exporter enabled (JAM_BROKER_OTEL_STDOUT=1)");
        }
        if let Some(addr) = metrics_addr {
            info!(%addr, "serving Prometheus metrics");
        }

        Ok(Self { tracer_provider })
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| is_truthy(&val))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
