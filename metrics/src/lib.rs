use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    host_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "container-mirror"))
        .with_attribute(KeyValue::new("service.name", "container-mirror"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new("mirror.host.id", host_id.to_string()))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and its drop on `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod sync_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use super::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub containers_upserted: Counter<u64>,
        pub containers_deleted: Counter<u64>,
        pub containers_swept: Counter<u64>,
        pub images_refreshed: Counter<u64>,
        pub host_refreshes: Counter<u64>,
        pub sync_errors: Counter<u64>,
        pub store_writes: Histogram<f64>,
        pub reconcile_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("container-mirror");

            let containers_upserted = meter
                .u64_counter("mirror.containers.upserted")
                .with_description("container records written to the store")
                .build();
            let containers_deleted = meter
                .u64_counter("mirror.containers.deleted")
                .with_description("container records deleted from the store")
                .build();
            let containers_swept = meter
                .u64_counter("mirror.containers.swept")
                .with_description("expired container ids pruned from the global index")
                .build();
            let images_refreshed = meter
                .u64_counter("mirror.images.refreshed")
                .with_description("image records written by image reconciliation")
                .build();
            let host_refreshes = meter
                .u64_counter("mirror.host.refreshes")
                .with_description("per-host container set replacements")
                .build();
            let sync_errors = meter
                .u64_counter("mirror.errors")
                .with_description("failed synchronisation operations")
                .build();
            let store_writes = meter
                .f64_histogram("mirror.store.writes")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("store transaction latencies in seconds")
                .build();
            let reconcile_duration = meter
                .f64_histogram("mirror.reconcile.duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("full reconciliation pass latencies in seconds")
                .build();

            Metrics {
                containers_upserted,
                containers_deleted,
                containers_swept,
                images_refreshed,
                host_refreshes,
                sync_errors,
                store_writes,
                reconcile_duration,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(Duration, usize)>>);

    impl TimerUpdate for Recorded {
        fn add(&self, duration: Duration, labels: &[KeyValue]) {
            self.0.lock().unwrap().push((duration, labels.len()));
        }
    }

    #[test]
    fn test_timer_records_on_drop() {
        let recorded = Recorded::default();
        {
            let _timer =
                Timer::start_with_labels(&recorded, &[KeyValue::new("operation", "upsert")]);
            std::thread::sleep(Duration::from_millis(5));
        }
        let recorded = recorded.0.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].0 >= Duration::from_millis(5));
        assert_eq!(recorded[0].1, 1);
    }

    #[test]
    fn test_metrics_without_provider() {
        let metrics = sync_stats::Metrics::new();
        metrics.containers_upserted.add(1, &[]);
        let _timer = Timer::start(&metrics.store_writes);
    }

    #[test]
    fn test_disabled_provider_is_none() {
        let provider = init_provider(false, None, Duration::from_secs(5), "h1", "0.1.0").unwrap();
        assert!(provider.is_none());
    }
}
