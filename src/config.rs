use std::{
    env,
    io,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use opentelemetry_sdk::{metrics::Temporality, trace::Sampler};
use thiserror::Error;

use crate::error::TelemetryError;

pub const DEFAULT_ENDPOINT: &str = "0.0.0.0:4317";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_SERVICE_NAME: &str = "default_application";
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const ENVIRONMENT_VAR: &str = "environment";
pub const SERVICE_NAME_VAR: &str = "SERVICE_NAME";
pub const SERVICE_VERSION_VAR: &str = "SERVICE_VERSION";
pub const EXPORTER_VAR: &str = "OTEL_TRACES_EXPORTER";
pub const INSECURE_VAR: &str = "OTEL_EXPORTER_OTLP_INSECURE";
pub const EXPORT_TIMEOUT_VAR: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
pub const COLLECTION_INTERVAL_VAR: &str = "OTEL_METRIC_EXPORT_INTERVAL";
pub const TEMPORALITY_VAR: &str = "OTEL_METRICS_TEMPORALITY";
pub const SAMPLER_VAR: &str = "OTEL_TRACES_SAMPLER";
pub const SAMPLER_ARG_VAR: &str = "OTEL_TRACES_SAMPLER_ARG";

/// Where spans and metrics are shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExporterKind {
    /// OTLP over gRPC to a collector.
    #[default]
    Otlp,
    /// Human readable dump on stdout, for local debugging.
    Stdout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Plaintext gRPC channel.
    #[default]
    Insecure,
    /// TLS channel verified against the platform's native roots.
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SamplingPolicy {
    #[default]
    AlwaysOn,
    AlwaysOff,
    TraceIdRatio(f64),
    ParentBasedAlwaysOn,
    ParentBasedAlwaysOff,
    ParentBasedTraceIdRatio(f64),
}

impl SamplingPolicy {
    /// Parses the standard `OTEL_TRACES_SAMPLER` names. A missing ratio
    /// argument means 1.0.
    pub fn parse(name: &str, arg: Option<&str>) -> Result<Self, TelemetryError> {
        let ratio = || -> Result<f64, TelemetryError> {
            match arg {
                None => Ok(1.0),
                Some(raw) => raw.trim().parse::<f64>().map_err(|_| {
                    TelemetryError::InvalidConfig(format!(
                        "{SAMPLER_ARG_VAR} must be a number, got {raw:?}"
                    ))
                }),
            }
        };

        match name.trim().to_ascii_lowercase().as_str() {
            "always_on" => Ok(SamplingPolicy::AlwaysOn),
            "always_off" => Ok(SamplingPolicy::AlwaysOff),
            "traceidratio" => Ok(SamplingPolicy::TraceIdRatio(ratio()?)),
            "parentbased_always_on" => Ok(SamplingPolicy::ParentBasedAlwaysOn),
            "parentbased_always_off" => Ok(SamplingPolicy::ParentBasedAlwaysOff),
            "parentbased_traceidratio" => Ok(SamplingPolicy::ParentBasedTraceIdRatio(ratio()?)),
            other => Err(TelemetryError::InvalidConfig(format!(
                "unknown sampler {other:?} in {SAMPLER_VAR}"
            ))),
        }
    }

    fn ratio(&self) -> Option<f64> {
        match self {
            SamplingPolicy::TraceIdRatio(ratio) | SamplingPolicy::ParentBasedTraceIdRatio(ratio) => {
                Some(*ratio)
            }
            _ => None,
        }
    }

    pub(crate) fn to_sampler(self) -> Sampler {
        match self {
            SamplingPolicy::AlwaysOn => Sampler::AlwaysOn,
            SamplingPolicy::AlwaysOff => Sampler::AlwaysOff,
            SamplingPolicy::TraceIdRatio(ratio) => Sampler::TraceIdRatioBased(ratio),
            SamplingPolicy::ParentBasedAlwaysOn => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
            SamplingPolicy::ParentBasedAlwaysOff => {
                Sampler::ParentBased(Box::new(Sampler::AlwaysOff))
            }
            SamplingPolicy::ParentBasedTraceIdRatio(ratio) => {
                Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricTemporality {
    #[default]
    Cumulative,
    Delta,
}

impl From<MetricTemporality> for Temporality {
    fn from(value: MetricTemporality) -> Self {
        match value {
            MetricTemporality::Cumulative => Temporality::Cumulative,
            MetricTemporality::Delta => Temporality::Delta,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("collector endpoint is empty")]
    Empty,
    #[error("unsupported collector endpoint scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("collector endpoint {0:?} has no port")]
    MissingPort(String),
    #[error("collector endpoint {0:?} has an invalid host")]
    InvalidHost(String),
    #[error("collector endpoint {0:?} has an invalid port")]
    InvalidPort(String),
}

/// A validated collector address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorEndpoint {
    host: String,
    port: u16,
    transport: Transport,
}

impl CollectorEndpoint {
    /// Accepts `host:port` or `http(s)://host:port[/path]`. An explicit scheme
    /// overrides `transport`.
    pub fn parse(raw: &str, transport: Transport) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EndpointError::Empty);
        }

        let (transport, rest) = match raw.split_once("://") {
            Some(("http", rest)) => (Transport::Insecure, rest),
            Some(("https", rest)) => (Transport::Tls, rest),
            Some((scheme, _)) => return Err(EndpointError::UnsupportedScheme(scheme.to_string())),
            None => (transport, raw),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(raw.to_string()))?;

        let bracketed = host.len() > 2 && host.starts_with('[') && host.ends_with(']');
        if host.is_empty()
            || host.chars().any(|c| c.is_whitespace() || c == '@')
            || (host.contains(':') && !bracketed)
        {
            return Err(EndpointError::InvalidHost(raw.to_string()));
        }

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| EndpointError::InvalidPort(raw.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
            transport,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// URI handed to the gRPC channel.
    pub fn uri(&self) -> String {
        let scheme = match self.transport {
            Transport::Insecure => "http",
            Transport::Tls => "https",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        Ok((host, self.port).to_socket_addrs()?.collect())
    }
}

/// Settings for both telemetry pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub environment: String,
    pub endpoint: String,
    pub service_name: String,
    pub service_version: Option<String>,
    pub exporter: ExporterKind,
    pub transport: Transport,
    pub sampling: SamplingPolicy,
    pub collection_interval: Duration,
    pub export_timeout: Duration,
    pub temporality: MetricTemporality,
    /// When set, the collector must accept a TCP connection within this
    /// duration before any pipeline is built.
    pub connect_timeout: Option<Duration>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            exporter: ExporterKind::default(),
            transport: Transport::default(),
            sampling: SamplingPolicy::default(),
            collection_interval: DEFAULT_COLLECTION_INTERVAL,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            temporality: MetricTemporality::default(),
            connect_timeout: None,
        }
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, TelemetryError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| TelemetryError::InvalidConfig(format!("{key} must be milliseconds, got {raw:?}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, TelemetryError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(TelemetryError::InvalidConfig(format!(
            "{key} must be true or false, got {raw:?}"
        ))),
    }
}

impl TelemetryConfig {
    /// Empty arguments fall back to the defaults.
    pub fn new(
        environment: impl Into<String>,
        endpoint: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            environment: or_default(environment.into(), DEFAULT_ENVIRONMENT),
            endpoint: or_default(endpoint.into(), DEFAULT_ENDPOINT),
            service_name: or_default(service_name.into(), DEFAULT_SERVICE_NAME),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, TelemetryError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves the configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TelemetryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut config = Self::new(
            var(ENVIRONMENT_VAR).unwrap_or_default(),
            var(ENDPOINT_VAR).unwrap_or_default(),
            var(SERVICE_NAME_VAR).unwrap_or_default(),
        );
        config.service_version = var(SERVICE_VERSION_VAR);

        if let Some(raw) = var(EXPORTER_VAR) {
            config.exporter = match raw.trim().to_ascii_lowercase().as_str() {
                "otlp" => ExporterKind::Otlp,
                "stdout" | "console" => ExporterKind::Stdout,
                _ => {
                    return Err(TelemetryError::InvalidConfig(format!(
                        "{EXPORTER_VAR} must be otlp, stdout or console, got {raw:?}"
                    )));
                }
            };
        }
        if let Some(raw) = var(INSECURE_VAR) {
            config.transport = if parse_bool(INSECURE_VAR, &raw)? {
                Transport::Insecure
            } else {
                Transport::Tls
            };
        }
        if let Some(raw) = var(EXPORT_TIMEOUT_VAR) {
            config.export_timeout = parse_millis(EXPORT_TIMEOUT_VAR, &raw)?;
        }
        if let Some(raw) = var(COLLECTION_INTERVAL_VAR) {
            config.collection_interval = parse_millis(COLLECTION_INTERVAL_VAR, &raw)?;
        }
        if let Some(raw) = var(TEMPORALITY_VAR) {
            config.temporality = match raw.trim().to_ascii_lowercase().as_str() {
                "cumulative" => MetricTemporality::Cumulative,
                "delta" => MetricTemporality::Delta,
                _ => {
                    return Err(TelemetryError::InvalidConfig(format!(
                        "{TEMPORALITY_VAR} must be cumulative or delta, got {raw:?}"
                    )));
                }
            };
        }
        if let Some(name) = var(SAMPLER_VAR) {
            config.sampling = SamplingPolicy::parse(&name, var(SAMPLER_ARG_VAR).as_deref())?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingPolicy) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_collection_interval(mut self, interval: Duration) -> Self {
        self.collection_interval = interval;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_temporality(mut self, temporality: MetricTemporality) -> Self {
        self.temporality = temporality;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.service_name.trim().is_empty() {
            return Err(TelemetryError::InvalidConfig(
                "service name must not be empty".to_string(),
            ));
        }
        if let Some(ratio) = self.sampling.ratio() {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(TelemetryError::InvalidConfig(format!(
                    "sampling ratio must be within [0, 1], got {ratio}"
                )));
            }
        }
        if self.collection_interval.is_zero() {
            return Err(TelemetryError::InvalidConfig(
                "metric collection interval must be greater than zero".to_string(),
            ));
        }
        if self.export_timeout.is_zero() {
            return Err(TelemetryError::InvalidConfig(
                "export timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn collector_endpoint(&self) -> Result<CollectorEndpoint, EndpointError> {
        CollectorEndpoint::parse(&self.endpoint, self.transport)
    }
}
