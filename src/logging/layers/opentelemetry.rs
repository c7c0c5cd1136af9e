use crate::logging::config::OpenTelemetryConfig;
use crate::logging::layers::BoxLayer;
use anyhow::{anyhow, Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{resource::Resource, trace::SdkTracerProvider};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use url::Url;

/// Flushes and shuts the tracer provider down when dropped.
pub struct OpenTelemetryGuard(SdkTracerProvider);

impl Drop for OpenTelemetryGuard {
    fn drop(&mut self) {
        let _ = self.0.force_flush();
        let _ = self.0.shutdown();
    }
}

/// Span export over OTLP/gRPC to the configured collector.
pub fn build_opentelemetry_layer<S>(
    config: &OpenTelemetryConfig,
) -> Result<(BoxLayer<S>, OpenTelemetryGuard)>
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync + 'static,
{
    let endpoint = config
        .endpoint
        .as_deref()
        .ok_or_else(|| anyhow!("no OTLP endpoint configured"))?;
    let endpoint = Url::parse(endpoint).context("invalid OTLP endpoint")?;

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.as_str())
        .build()
        .context("failed to build OTLP exporter")?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    let layer = OpenTelemetryLayer::new(tracer);

    Ok((Box::new(layer), OpenTelemetryGuard(provider)))
}
