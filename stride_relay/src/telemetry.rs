use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    frame_counter: Counter<u64>,
    inference_duration: Histogram<u64>,
    publish_failures: Counter<u64>,
    calibration_entries: Gauge<u64>,
    // Held so the exporter keeps collecting when the global provider is replaced.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("stride_relay");
        global::set_meter_provider(provider.clone());

        let frame_counter = meter
            .u64_counter("frames_total")
            .with_description("Total number of inbound events handled")
            .build();

        let boundaries = generate_boundaries((10, 50, 100, 500, 1500));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Wall time of inference calls in milliseconds")
            .build();

        let publish_failures = meter
            .u64_counter("publish_failures_total")
            .with_description("Pushes to client connections that failed")
            .build();

        let calibration_entries = meter
            .u64_gauge("calibration_entries")
            .with_description("Entries in the class height cache")
            .build();

        Ok(Metrics {
            frame_counter,
            inference_duration,
            publish_failures,
            calibration_entries,
            _provider: provider,
            registry,
        })
    }

    pub fn record_frame(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.frame_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, outcome: &str) {
        let attributes = vec![KeyValue::new("outcome", outcome.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_publish_failure(&self, reason: &str) {
        let attributes = vec![KeyValue::new("reason", reason.to_string())];
        self.publish_failures.add(1, &attributes);
    }

    pub fn record_calibration_entries(&self, entries: usize) {
        self.calibration_entries.record(entries as u64, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 25;
    let end_step: usize = 100;
    let tail_step: usize = 250;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let parts = (10, 50, 100, 500, 1500);
        let get = generate_boundaries(parts);
        let expected = vec![
            10.0, 20.0, 30.0, 40.0, 50.0, 75.0, 100.0, 200.0, 300.0, 400.0, 500.0, 750.0, 1000.0,
            1250.0, 1500.0,
        ];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_frame("frame");
        metrics.record_publish_failure("gone");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("frames_total"));
        assert!(text.contains("publish_failures_total"));
    }

    #[test]
    fn test_metrics_survive_second_instance() {
        let first = Metrics::new().unwrap();
        let _second = Metrics::new().unwrap();
        first.record_frame("frame");

        let families = first.registry.gather();
        assert!(families.iter().any(|f| f.get_name().starts_with("frames_total")));
    }
}
