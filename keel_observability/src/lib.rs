//! Logging, tracing and metrics setup shared by the dispatch crates.
use std::borrow::Cow;
use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{InstrumentationScope, global};
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader};
use opentelemetry_sdk::trace::SdkTracerProvider;
use snafu::{ResultExt, Snafu};
use tracing::Subscriber;
use tracing_opentelemetry::MetricsLayer;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::{prelude::*, registry::LookupSpan};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

pub use crate::metrics::{MetricSample, MetricsExporter};

mod metrics;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const RUST_LOG_FORMAT: &str = "RUST_LOG_FORMAT";
const EXPORT_INTERVAL: Duration = Duration::from_secs(10);

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum ObservabilityError {
    #[snafu(display("Failed to build exporter"))]
    Exporter { source: ExporterBuildError },
    #[snafu(display("Failed to collect metrics"))]
    Collect { source: OTelSdkError },
}

/// How log lines are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse the value of `RUST_LOG_FORMAT`, falling back to compact output.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }

    fn from_env() -> Self {
        std::env::var(RUST_LOG_FORMAT)
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }
}

pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

/// Install the global tracing subscriber and meter provider.
///
/// Logs go to stdout, filtered by `RUST_LOG` (default `info`). Metrics are
/// always readable through `metrics_exporter`. Traces and metrics are also
/// exported over OTLP, but only when `OTEL_SDK_DISABLED=false`.
pub fn init_observability(
    package_name: impl Into<Cow<'static, str>>,
    package_version: impl Into<Cow<'static, str>>,
    metrics_exporter: MetricsExporter,
) -> Result<(), ObservabilityError> {
    let sdk_enabled = otlp_enabled(std::env::var(OTEL_SDK_DISABLED).ok().as_deref());

    let otel_layer = otel(package_name, package_version, metrics_exporter, sdk_enabled)?;
    let layers = vec![stdout(LogFormat::from_env()), otel_layer];

    tracing_subscriber::registry().with(layers).init();

    Ok(())
}

/// OTLP export is off unless `OTEL_SDK_DISABLED` is exactly `false`.
fn otlp_enabled(sdk_disabled: Option<&str>) -> bool {
    sdk_disabled == Some("false")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO"))
}

fn stdout<S>(format: LogFormat) -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(true);

    match format {
        LogFormat::Json => layer
            .with_ansi(false)
            .json()
            .with_filter(env_filter())
            .boxed(),
        LogFormat::Pretty => layer.pretty().with_filter(env_filter()).boxed(),
        LogFormat::Compact => layer
            .with_ansi(true)
            .compact()
            .with_filter(env_filter())
            .boxed(),
    }
}

fn otel<S>(
    package_name: impl Into<Cow<'static, str>>,
    version: impl Into<Cow<'static, str>>,
    additional_reader: MetricsExporter,
    sdk_enabled: bool,
) -> Result<BoxedLayer<S>, ObservabilityError>
where
    S: Subscriber + Send + Sync,
    for<'a> S: LookupSpan<'a>,
{
    let resource = Resource::builder().build();

    let scope = InstrumentationScope::builder(package_name.into())
        .with_version(version.into())
        .build();

    let mut trace_provider = SdkTracerProvider::builder().with_resource(resource.clone());
    if sdk_enabled {
        let span_exporter = SpanExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu {})?;
        trace_provider = trace_provider.with_batch_exporter(span_exporter);
    }
    let tracer = trace_provider.build().tracer_with_scope(scope);

    let mut meter_provider = MeterProviderBuilder::default()
        .with_resource(resource)
        .with_reader(additional_reader);
    if sdk_enabled {
        let exporter = MetricExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu {})?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(EXPORT_INTERVAL)
            .build();
        meter_provider = meter_provider.with_reader(reader);
    }
    let meter_provider = meter_provider.build();

    global::set_meter_provider(meter_provider.clone());

    let layer = env_filter()
        .and_then(MetricsLayer::new(meter_provider))
        .and_then(tracing_opentelemetry::layer().with_tracer(tracer))
        .boxed();

    Ok(layer)
}
