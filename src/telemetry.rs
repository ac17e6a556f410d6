use std::{
    io,
    net::TcpStream,
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{error, info, warn};
use opentelemetry::{
    global::{self, BoxedTracer, GlobalTracerProvider},
    metrics::{Meter, MeterProvider},
    trace::TracerProvider,
};
use opentelemetry_otlp::{WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    error::{
        OTelSdkError::{self, AlreadyShutdown, InternalFailure, Timeout},
        OTelSdkResult,
    },
    metrics::{PeriodicReader, SdkMeterProvider, exporter::PushMetricExporter},
    trace::{Sampler, SdkTracer, SdkTracerProvider, SpanExporter},
};
use tonic::transport::ClientTlsConfig;

use crate::{
    config::{CollectorEndpoint, ExporterKind, TelemetryConfig, Transport},
    error::{BoxError, FlushError, ShutdownError, Signal, TelemetryError},
    resource::build_resource,
    statics::{InstalledProviders, installed_providers, next_generation},
};

/// Owned handle over a trace and a meter pipeline.
///
/// Handles returned by [`init_telemetry`] are also published as the process
/// globals; handles built with [`Telemetry::new`] are private to their owner.
#[derive(Debug)]
pub struct Telemetry {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    resource: Resource,
    generation: Option<u64>,
}

impl Telemetry {
    /// Builds both pipelines over the given exporters without touching the
    /// process globals.
    pub fn new<S, M>(
        config: &TelemetryConfig,
        span_exporter: S,
        metric_exporter: M,
    ) -> Result<Self, TelemetryError>
    where
        S: SpanExporter + 'static,
        M: PushMetricExporter + 'static,
    {
        config.validate()?;
        Self::build(config, span_exporter, metric_exporter)
    }

    // callers validate `config` first
    fn build<S, M>(
        config: &TelemetryConfig,
        span_exporter: S,
        metric_exporter: M,
    ) -> Result<Self, TelemetryError>
    where
        S: SpanExporter + 'static,
        M: PushMetricExporter + 'static,
    {
        let resource = build_resource(config)?;
        let tracer_provider = build_tracer_provider(config, span_exporter, resource.clone());
        let meter_provider = build_meter_provider(config, metric_exporter, resource.clone());

        Ok(Self {
            tracer_provider,
            meter_provider,
            resource,
            generation: None,
        })
    }

    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.meter_provider
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Whether this handle's providers are still the installed globals.
    pub fn is_installed(&self) -> bool {
        self.generation.is_some_and(|generation| {
            installed_providers()
                .as_ref()
                .is_some_and(|current| current.generation == generation)
        })
    }

    pub fn tracer(&self, name: &'static str) -> SdkTracer {
        self.tracer_provider.tracer(name)
    }

    pub fn meter(&self, name: &'static str) -> Meter {
        self.meter_provider.meter(name)
    }

    /// Exports everything queued on both pipelines without stopping them.
    pub fn force_flush(&self) -> Result<(), FlushError> {
        flush_providers(&self.tracer_provider, &self.meter_provider)
    }

    /// Flushes and stops both pipelines. If this handle still owns the process
    /// globals they are released and replaced by inert providers first.
    pub fn shutdown(self) -> Result<(), ShutdownError> {
        if let Some(generation) = self.generation {
            if release_installed(Some(generation)).is_some() {
                info!(generation = generation; "Released global telemetry providers");
            }
        }
        shutdown_providers(&self.tracer_provider, &self.meter_provider)
    }

    /// Same as [`Telemetry::shutdown`], giving up after `deadline`.
    pub fn shutdown_with_deadline(self, deadline: Duration) -> Result<(), ShutdownError> {
        run_with_deadline(deadline, move || self.shutdown())
    }
}

/// Builds the pipelines described by `config` and publishes them as the
/// process-wide tracer and meter providers.
///
/// Fails with [`TelemetryError::AlreadyInitialized`] while a previous
/// installation has not been shut down. OTLP exporters must be built inside a
/// multi-threaded Tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    install_with(config, || match config.exporter {
        ExporterKind::Otlp => {
            // a bad config must not surface as an exporter error
            config.validate()?;
            let (span_exporter, metric_exporter) = otlp_exporters(config)?;
            Telemetry::build(config, span_exporter, metric_exporter)
        }
        ExporterKind::Stdout => {
            let metric_exporter = opentelemetry_stdout::MetricExporter::builder()
                .with_temporality(config.temporality.into())
                .build();
            Telemetry::new(
                config,
                opentelemetry_stdout::SpanExporter::default(),
                metric_exporter,
            )
        }
    })
}

/// [`init_telemetry`] over caller-supplied exporters.
pub fn init_telemetry_with_exporters<S, M>(
    config: &TelemetryConfig,
    span_exporter: S,
    metric_exporter: M,
) -> Result<Telemetry, TelemetryError>
where
    S: SpanExporter + 'static,
    M: PushMetricExporter + 'static,
{
    install_with(config, || Telemetry::new(config, span_exporter, metric_exporter))
}

pub fn get_tracer_provider() -> GlobalTracerProvider {
    global::tracer_provider()
}

pub fn get_meter_provider() -> Arc<dyn MeterProvider + Send + Sync> {
    global::meter_provider()
}

pub fn tracer(name: &'static str) -> BoxedTracer {
    global::tracer(name)
}

pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

// global counterpart of Telemetry::force_flush
pub fn force_flush_telemetry() -> Result<(), FlushError> {
    let providers = installed_providers()
        .clone()
        .ok_or(FlushError::NotInitialized)?;
    flush_providers(&providers.tracer, &providers.meter)
}

/// Releases the installed providers, then flushes and stops them.
///
/// Both pipelines are always stopped; when both fail the errors are reported
/// together as [`ShutdownError::Aggregate`].
pub fn shutdown_telemetry() -> Result<(), ShutdownError> {
    let providers = release_installed(None).ok_or(ShutdownError::NotInitialized)?;
    info!(generation = providers.generation; "Shutting down global telemetry providers");
    shutdown_providers(&providers.tracer, &providers.meter)
}

pub fn shutdown_telemetry_with_deadline(deadline: Duration) -> Result<(), ShutdownError> {
    run_with_deadline(deadline, shutdown_telemetry)
}

fn install_with<F>(config: &TelemetryConfig, build: F) -> Result<Telemetry, TelemetryError>
where
    F: FnOnce() -> Result<Telemetry, TelemetryError>,
{
    let mut installed = installed_providers();
    if let Some(current) = installed.as_ref() {
        warn!(generation = current.generation; "Telemetry providers are already installed");
        return Err(TelemetryError::AlreadyInitialized);
    }

    let mut telemetry = build()?;
    let generation = next_generation();

    global::set_tracer_provider(telemetry.tracer_provider.clone());
    global::set_meter_provider(telemetry.meter_provider.clone());
    *installed = Some(InstalledProviders {
        generation,
        tracer: telemetry.tracer_provider.clone(),
        meter: telemetry.meter_provider.clone(),
    });
    telemetry.generation = Some(generation);

    info!(
        service = config.service_name.as_str(),
        environment = config.environment.as_str(),
        endpoint = config.endpoint.as_str(),
        generation = generation;
        "Installed global telemetry providers"
    );
    Ok(telemetry)
}

// `None` releases whatever is installed, `Some` only a matching installation
fn release_installed(generation: Option<u64>) -> Option<InstalledProviders> {
    let mut installed = installed_providers();
    let owned = match (installed.as_ref(), generation) {
        (Some(_), None) => true,
        (Some(current), Some(generation)) => current.generation == generation,
        (None, _) => false,
    };
    if !owned {
        return None;
    }

    let providers = installed.take();
    global::set_tracer_provider(
        SdkTracerProvider::builder()
            .with_sampler(Sampler::AlwaysOff)
            .build(),
    );
    global::set_meter_provider(SdkMeterProvider::builder().build());
    providers
}

fn build_tracer_provider<S>(
    config: &TelemetryConfig,
    exporter: S,
    resource: Resource,
) -> SdkTracerProvider
where
    S: SpanExporter + 'static,
{
    SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(config.sampling.to_sampler())
        .with_resource(resource)
        .build()
}

// the periodic reader starts its collection thread while being built
fn build_meter_provider<M>(
    config: &TelemetryConfig,
    exporter: M,
    resource: Resource,
) -> SdkMeterProvider
where
    M: PushMetricExporter + 'static,
{
    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.collection_interval)
        .build();
    SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build()
}

fn exporter_error(signal: Signal, endpoint: &str, source: impl Into<BoxError>) -> TelemetryError {
    TelemetryError::ExporterCreation {
        signal,
        endpoint: endpoint.to_string(),
        source: source.into(),
    }
}

fn otlp_exporters(
    config: &TelemetryConfig,
) -> Result<(opentelemetry_otlp::SpanExporter, opentelemetry_otlp::MetricExporter), TelemetryError> {
    let endpoint = config
        .collector_endpoint()
        .map_err(|e| exporter_error(Signal::Traces, &config.endpoint, e))?;

    if tokio::runtime::Handle::try_current().is_err() {
        return Err(exporter_error(
            Signal::Traces,
            &config.endpoint,
            "OTLP over gRPC needs a running Tokio runtime",
        ));
    }

    if let Some(timeout) = config.connect_timeout {
        dial_collector(&endpoint, timeout)
            .map_err(|e| exporter_error(Signal::Traces, &config.endpoint, e))?;
    }

    let uri = endpoint.uri();
    let tls = endpoint.transport() == Transport::Tls;

    let mut span_builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(uri.clone())
        .with_timeout(config.export_timeout);
    if tls {
        span_builder = span_builder.with_tls_config(ClientTlsConfig::new().with_native_roots());
    }
    let span_exporter = span_builder
        .build()
        .map_err(|e| exporter_error(Signal::Traces, &config.endpoint, e))?;

    let mut metric_builder = opentelemetry_otlp::MetricExporter::builder()
        .with_temporality(config.temporality.into())
        .with_tonic()
        .with_endpoint(uri)
        .with_timeout(config.export_timeout);
    if tls {
        metric_builder = metric_builder.with_tls_config(ClientTlsConfig::new().with_native_roots());
    }
    let metric_exporter = metric_builder
        .build()
        .map_err(|e| exporter_error(Signal::Metrics, &config.endpoint, e))?;

    info!(uri = endpoint.uri().as_str(), tls = tls; "Created OTLP exporters");
    Ok((span_exporter, metric_exporter))
}

fn dial_collector(endpoint: &CollectorEndpoint, timeout: Duration) -> io::Result<()> {
    let mut last_error = None;
    for addr in endpoint.socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "collector endpoint resolved to no addresses",
        )
    }))
}

fn flush_providers(
    tracer: &SdkTracerProvider,
    meter: &SdkMeterProvider,
) -> Result<(), FlushError> {
    let traces = flush_provider(Signal::Traces, || tracer.force_flush());
    let metrics = flush_provider(Signal::Metrics, || meter.force_flush());
    traces.and(metrics)
}

// a timed out flush gets exactly one retry
fn flush_provider<F>(signal: Signal, flush: F) -> Result<(), FlushError>
where
    F: Fn() -> OTelSdkResult,
{
    let mut retried = false;
    loop {
        match flush() {
            Ok(_) | Err(AlreadyShutdown) => return Ok(()),
            Err(Timeout(d)) if !retried => {
                retried = true;
                warn!(signal = signal.to_string().as_str(), timeout = d.as_millis(); "Force export timed out, retrying");
            }
            Err(source) => {
                error!(signal = signal.to_string().as_str(), error = format!("{}", source).as_str(); "Force export failed");
                return Err(FlushError::Export { signal, source });
            }
        }
    }
}

fn shutdown_providers(
    tracer: &SdkTracerProvider,
    meter: &SdkMeterProvider,
) -> Result<(), ShutdownError> {
    let flush = settle(Signal::Traces, tracer.shutdown());
    let collection = settle(Signal::Metrics, meter.shutdown());

    match (flush, collection) {
        (None, None) => Ok(()),
        (Some(flush), None) => Err(ShutdownError::Flush(flush)),
        (None, Some(collection)) => Err(ShutdownError::CollectionStop(collection)),
        (Some(flush), Some(collection)) => Err(ShutdownError::Aggregate { flush, collection }),
    }
}

fn settle(signal: Signal, result: OTelSdkResult) -> Option<OTelSdkError> {
    match result {
        Ok(_) | Err(AlreadyShutdown) => None,
        Err(Timeout(d)) => {
            warn!(signal = signal.to_string().as_str(), timeout = d.as_millis(); "Provider shutdown timed out");
            Some(Timeout(d))
        }
        Err(InternalFailure(e)) => {
            error!(signal = signal.to_string().as_str(), error = e.as_str(); "Provider shutdown failed");
            Some(InternalFailure(e))
        }
    }
}

fn run_with_deadline<F>(deadline: Duration, shutdown: F) -> Result<(), ShutdownError>
where
    F: FnOnce() -> Result<(), ShutdownError> + Send + 'static,
{
    let (sender, receiver) = bounded(1);
    thread::Builder::new()
        .name("telemetry-shutdown".to_string())
        .spawn(move || {
            // the receiver is gone once the deadline passed
            let _ = sender.send(shutdown());
        })
        .map_err(|e| ShutdownError::ShutdownThread(e.to_string()))?;

    match receiver.recv_timeout(deadline) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(deadline = deadline.as_millis(); "Telemetry shutdown missed its deadline");
            Err(ShutdownError::DeadlineExceeded(deadline))
        }
        Err(RecvTimeoutError::Disconnected) => Err(ShutdownError::ShutdownThread(
            "shutdown thread exited without reporting".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::{
        KeyValue,
        trace::{Span, Tracer},
    };
    use opentelemetry_sdk::{metrics::InMemoryMetricExporter, trace::InMemorySpanExporter};

    use super::*;
    use crate::config::SamplingPolicy;

    fn staging_config() -> TelemetryConfig {
        TelemetryConfig::new("staging", "localhost:4317", "billing-svc")
    }

    #[test]
    fn finished_span_reaches_the_exporter_on_flush() {
        let spans = InMemorySpanExporter::default();
        let telemetry =
            Telemetry::new(&staging_config(), spans.clone(), InMemoryMetricExporter::default())
                .unwrap();
        assert!(!telemetry.is_installed());

        let mut span = telemetry.tracer("billing").start("charge");
        assert!(span.is_recording());
        span.set_attribute(KeyValue::new("amount", 42));
        span.end();
        telemetry.force_flush().unwrap();

        let finished = spans.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "charge");
        assert!(finished[0].span_context.is_sampled());

        telemetry.shutdown().unwrap();
    }

    #[test]
    fn resource_is_shared_with_both_providers() {
        let telemetry = Telemetry::new(
            &staging_config(),
            InMemorySpanExporter::default(),
            InMemoryMetricExporter::default(),
        )
        .unwrap();

        let environment = telemetry
            .resource()
            .iter()
            .find(|(key, _)| key.as_str() == "environment")
            .map(|(_, value)| value.to_string());
        assert_eq!(environment.as_deref(), Some("staging"));

        telemetry.shutdown().unwrap();
    }

    #[test]
    fn always_off_sampling_exports_nothing() {
        let spans = InMemorySpanExporter::default();
        let config = staging_config().with_sampling(SamplingPolicy::AlwaysOff);
        let telemetry =
            Telemetry::new(&config, spans.clone(), InMemoryMetricExporter::default()).unwrap();

        let span = telemetry.tracer("billing").start("charge");
        assert!(!span.is_recording());
        drop(span);
        telemetry.force_flush().unwrap();

        assert!(spans.get_finished_spans().unwrap().is_empty());
        telemetry.shutdown().unwrap();
    }

    #[test]
    fn recorded_measurements_are_collected_on_flush() {
        let metrics = InMemoryMetricExporter::default();
        let telemetry =
            Telemetry::new(&staging_config(), InMemorySpanExporter::default(), metrics.clone())
                .unwrap();

        let charges = telemetry.meter("billing").u64_counter("charges").build();
        charges.add(3, &[KeyValue::new("currency", "EUR")]);
        let latency = telemetry.meter("billing").f64_histogram("charge_latency").build();
        latency.record(12.5, &[]);
        telemetry.force_flush().unwrap();

        assert!(!metrics.get_finished_metrics().unwrap().is_empty());
        telemetry.shutdown().unwrap();
    }

    #[test]
    fn invalid_config_builds_nothing() {
        let config = staging_config().with_sampling(SamplingPolicy::TraceIdRatio(-0.5));
        let result = Telemetry::new(
            &config,
            InMemorySpanExporter::default(),
            InMemoryMetricExporter::default(),
        );
        assert!(matches!(result, Err(TelemetryError::InvalidConfig(_))));
    }

    #[test]
    fn stopping_providers_twice_is_not_an_error() {
        let telemetry = Telemetry::new(
            &staging_config(),
            InMemorySpanExporter::default(),
            InMemoryMetricExporter::default(),
        )
        .unwrap();
        let tracer = telemetry.tracer_provider().clone();
        let meter = telemetry.meter_provider().clone();

        telemetry.shutdown().unwrap();
        assert!(shutdown_providers(&tracer, &meter).is_ok());
    }

    #[test]
    fn timed_out_flush_is_retried_once() {
        let attempts = std::cell::Cell::new(0);
        let result = flush_provider(Signal::Traces, || {
            attempts.set(attempts.get() + 1);
            if attempts.get() == 1 {
                Err(Timeout(Duration::from_millis(5)))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(attempts.get(), 2);

        let result = flush_provider(Signal::Metrics, || Err(Timeout(Duration::from_millis(5))));
        assert!(matches!(
            result,
            Err(FlushError::Export {
                signal: Signal::Metrics,
                source: Timeout(_)
            })
        ));
    }

    #[test]
    fn settle_ignores_already_shutdown() {
        assert!(settle(Signal::Traces, Err(AlreadyShutdown)).is_none());
        assert!(settle(Signal::Traces, Ok(())).is_none());
        assert!(matches!(
            settle(Signal::Metrics, Err(InternalFailure("boom".to_string()))),
            Some(InternalFailure(_))
        ));
    }

    #[test]
    fn slow_shutdown_misses_its_deadline() {
        let result = run_with_deadline(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert!(matches!(result, Err(ShutdownError::DeadlineExceeded(_))));

        let result = run_with_deadline(Duration::from_secs(5), || Err(ShutdownError::NotInitialized));
        assert!(matches!(result, Err(ShutdownError::NotInitialized)));
    }
}
