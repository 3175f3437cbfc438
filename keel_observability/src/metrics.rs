use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use opentelemetry::KeyValue;
use opentelemetry_sdk::{
    error::OTelSdkResult,
    metrics::{
        InstrumentKind, ManualReader, Pipeline, Temporality,
        data::{AggregatedMetrics, Metric, MetricData, ResourceMetrics},
        reader::MetricReader,
    },
};
use snafu::ResultExt;

use crate::{CollectSnafu, ObservabilityError};

/// A metric reader that can be collected on demand.
///
/// Clones share the same underlying reader, so a clone kept by the caller
/// sees everything recorded through the provider it was registered with.
#[derive(Clone, Debug)]
pub struct MetricsExporter {
    reader: Arc<ManualReader>,
}

/// One data point of a sum or gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub attributes: Vec<(String, String)>,
}

impl MetricsExporter {
    /// Collect the current value of every sum and gauge data point.
    ///
    /// Histograms are skipped.
    pub fn snapshot(&self) -> Result<Vec<MetricSample>, ObservabilityError> {
        let mut rm = ResourceMetrics::default();
        self.reader.collect(&mut rm).context(CollectSnafu {})?;

        let mut samples = Vec::new();
        for scope in rm.scope_metrics() {
            for metric in scope.metrics() {
                add_samples(&mut samples, metric);
            }
        }

        Ok(samples)
    }

    /// Sum every data point of the named metric, across all attributes.
    pub fn total(&self, name: &str) -> Result<f64, ObservabilityError> {
        Ok(self
            .snapshot()?
            .iter()
            .filter(|sample| sample.name == name)
            .map(|sample| sample.value)
            .sum())
    }
}

fn add_samples(samples: &mut Vec<MetricSample>, metric: &Metric) {
    match metric.data() {
        AggregatedMetrics::U64(data) => push_points(samples, metric.name(), data, |v| v as f64),
        AggregatedMetrics::I64(data) => push_points(samples, metric.name(), data, |v| v as f64),
        AggregatedMetrics::F64(data) => push_points(samples, metric.name(), data, |v| v),
    }
}

fn push_points<T: Copy>(
    samples: &mut Vec<MetricSample>,
    name: &str,
    data: &MetricData<T>,
    to_f64: impl Fn(T) -> f64,
) {
    match data {
        MetricData::Sum(sum) => {
            for dp in sum.data_points() {
                samples.push(sample(name, to_f64(dp.value()), dp.attributes()));
            }
        }
        MetricData::Gauge(gauge) => {
            for dp in gauge.data_points() {
                samples.push(sample(name, to_f64(dp.value()), dp.attributes()));
            }
        }
        MetricData::Histogram(_) | MetricData::ExponentialHistogram(_) => {}
    }
}

fn sample<'a>(
    name: &str,
    value: f64,
    attributes: impl Iterator<Item = &'a KeyValue>,
) -> MetricSample {
    MetricSample {
        name: name.to_string(),
        value,
        attributes: attributes
            .map(|kv| (kv.key.as_str().to_string(), kv.value.to_string()))
            .collect(),
    }
}

impl MetricReader for MetricsExporter {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.reader.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.reader.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.reader.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.reader.shutdown_with_timeout(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.reader.temporality(kind)
    }
}

impl Default for MetricsExporter {
    fn default() -> Self {
        let reader = ManualReader::builder().build();
        Self {
            reader: Arc::new(reader),
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let exporter = MetricsExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(exporter.clone())
            .build();

        let counter = provider.meter("test").u64_counter("requests").build();
        counter.add(2, &[KeyValue::new("outcome", "success")]);
        counter.add(3, &[KeyValue::new("outcome", "failed")]);

        let samples = exporter.snapshot().unwrap();
        let success = samples
            .iter()
            .find(|s| s.attributes.contains(&("outcome".to_string(), "success".to_string())))
            .unwrap();
        assert_eq!(success.name, "requests");
        assert_eq!(success.value, 2.0);

        assert_eq!(exporter.total("requests").unwrap(), 5.0);
        assert_eq!(exporter.total("missing").unwrap(), 0.0);
    }
}
