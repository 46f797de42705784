use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing::Metadata;
use tracing_subscriber::{
    filter::FilterExt,
    layer::{self, Filter, SubscriberExt},
    Layer,
};

use crate::config::NodeConfig;

/// Keeps the transport's own spans out of the exported traces.
struct NoisyModulesFilter;

impl<S> Filter<S> for NoisyModulesFilter {
    fn enabled(&self, metadata: &Metadata<'_>, _: &layer::Context<'_, S>) -> bool {
        let target = metadata.target();
        !target.starts_with("h2::") && !target.starts_with("tower::") && !target.starts_with("hyper")
    }
}

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &NodeConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_list(false)
                .flatten_event(true)
                .with_current_span(true),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .with_ansi(std::io::stderr().is_terminal())
            .compact(),
    )
}

/// Install the global subscriber. Returns the tracer provider when spans are
/// exported so the caller can flush it on shutdown.
pub fn setup_tracing(config: &NodeConfig) -> Result<Option<SdkTracerProvider>> {
    let base = tracing_subscriber::Registry::default();

    if !config.telemetry.enable_tracing {
        let log_layer = get_log_layer(config).with_filter(get_env_filter());
        tracing::subscriber::set_global_default(base.with(log_layer))?;
        return Ok(None);
    }

    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(Resource::builder_empty().with_service_name("qsd-node").build())
        .with_batch_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let span_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer("qsd-node"))
        .with_filter(NoisyModulesFilter.and(get_env_filter()));
    let subscriber = base.with(span_layer);
    let log_layer = get_log_layer(config).with_filter(get_env_filter());
    tracing::subscriber::set_global_default(subscriber.with(log_layer))?;

    Ok(Some(tracer_provider))
}
