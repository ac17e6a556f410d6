use std::{net::TcpListener, time::Duration};

use opentelemetry::trace::{Span, Tracer, TracerProvider};
use telemetry_bootstrap::{
    SamplingPolicy, ShutdownError, Signal, TelemetryConfig, TelemetryError, get_tracer_provider,
    init_telemetry, shutdown_telemetry,
};

// nothing in this binary ever installs providers
fn assert_nothing_published() {
    let span = get_tracer_provider().tracer("otlp").start("checkout");
    assert!(!span.is_recording());
    assert!(matches!(shutdown_telemetry(), Err(ShutdownError::NotInitialized)));
}

#[test]
fn malformed_endpoint_is_an_exporter_creation_error() {
    let config = TelemetryConfig::new("staging", "collector-without-port", "billing-svc");
    let error = init_telemetry(&config).unwrap_err();
    assert!(matches!(
        error,
        TelemetryError::ExporterCreation {
            signal: Signal::Traces,
            ..
        }
    ));
    assert_nothing_published();
}

#[test]
fn otlp_without_tokio_runtime_is_rejected() {
    let config = TelemetryConfig::new("staging", "localhost:4317", "billing-svc");
    let error = init_telemetry(&config).unwrap_err();
    assert!(matches!(error, TelemetryError::ExporterCreation { .. }));
    assert_nothing_published();
}

#[test]
fn invalid_sampling_ratio_is_rejected() {
    let config = TelemetryConfig::new("staging", "localhost:4317", "billing-svc")
        .with_sampling(SamplingPolicy::ParentBasedTraceIdRatio(2.0));
    let error = init_telemetry(&config).unwrap_err();
    assert!(matches!(error, TelemetryError::InvalidConfig(_)));
    assert_nothing_published();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_collector_fails_the_connect_check() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = TelemetryConfig::new("staging", format!("127.0.0.1:{port}"), "billing-svc")
        .with_connect_timeout(Duration::from_millis(500));

    let error = init_telemetry(&config).unwrap_err();
    assert!(matches!(error, TelemetryError::ExporterCreation { .. }));
    assert!(error.to_string().contains(&format!("127.0.0.1:{port}")));
    assert_nothing_published();
}
