use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use pin_project_lite::pin_project;

pin_project! {
    /// Future that reports its own latency and output once it completes.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct TimedFuture<F, C>
    where
        F: Future,
        C: FnOnce(Duration, &F::Output),
    {
        #[pin]
        inner: F,
        start: Instant,
        // Taken on completion, a finished future may still be polled.
        callback: Option<C>,
    }
}

impl<F, C> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration, &F::Output),
{
    pub fn new(inner: F, callback: C) -> Self {
        Self {
            inner,
            start: Instant::now(),
            callback: Some(callback),
        }
    }
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration, &F::Output),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(output) => {
                if let Some(callback) = this.callback.take() {
                    callback(this.start.elapsed(), &output);
                }
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

/// Install the global meter provider exporting over OTLP. Returns `None`
/// when metrics are disabled, leaving the no-op global meter in place.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> anyhow::Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "qsd"))
        .with_attribute(KeyValue::new("service.name", "qsd-node"))
        .with_attribute(KeyValue::new("qsd.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
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

pub mod chain_ops {
    use std::{future::Future, time::Duration};

    use opentelemetry::{
        metrics::{Counter, Histogram, UpDownCounter},
        KeyValue,
    };

    use crate::TimedFuture;

    /// Volume and snapshot operations served by the node.
    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub operations: Counter<u64>,
        pub latency: Histogram<f64>,
        pub in_flight: UpDownCounter<i64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("qsd-node");
            let operations = meter
                .u64_counter("qsd.chain.operations")
                .with_description("volume and snapshot operations by outcome")
                .build();
            let latency = meter
                .f64_histogram("qsd.chain.operation_latency")
                .with_description("volume and snapshot operation latencies in seconds")
                .with_unit("s")
                .build();
            let in_flight = meter
                .i64_up_down_counter("qsd.chain.operations_in_flight")
                .with_description("operations currently running")
                .build();
            Metrics {
                operations,
                latency,
                in_flight,
            }
        }

        pub fn record(&self, operation: &'static str, elapsed: Duration, ok: bool) {
            let outcome = if ok { "ok" } else { "error" };
            let labels = [
                KeyValue::new("operation", operation),
                KeyValue::new("outcome", outcome),
            ];
            self.operations.add(1, &labels);
            self.latency.record(elapsed.as_secs_f64(), &labels);
        }

        /// Time `future` and count its outcome under `operation`.
        pub fn timed<F, T, E>(
            &self,
            operation: &'static str,
            future: F,
        ) -> TimedFuture<F, impl FnOnce(Duration, &Result<T, E>)>
        where
            F: Future<Output = Result<T, E>>,
        {
            let metrics = self.clone();
            let in_flight = self.in_flight.clone();
            let labels = [KeyValue::new("operation", operation)];
            in_flight.add(1, &labels);
            TimedFuture::new(future, move |elapsed, output: &Result<T, E>| {
                in_flight.add(-1, &labels);
                metrics.record(operation, elapsed, output.is_ok());
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn test_timed_future_reports_once_with_output() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let output = TimedFuture::new(async { 21 * 2 }, move |elapsed, out: &i32| {
            assert!(elapsed < Duration::from_secs(5));
            assert_eq!(*out, 42);
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert_eq!(output, 42);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let provider =
            init_provider(false, None, Duration::from_secs(10), "local-test", "0.1.0").unwrap();
        assert!(provider.is_none());
    }

    #[tokio::test]
    async fn test_timed_operation_passes_result_through() {
        // Without a registered provider the global meter is a no-op.
        let metrics = chain_ops::Metrics::new();
        let ok: Result<u8, String> = metrics.timed("create_volume", async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
        let err: Result<u8, String> = metrics
            .timed("delete_volume", async { Err("boom".to_string()) })
            .await;
        assert!(err.is_err());
    }
}
