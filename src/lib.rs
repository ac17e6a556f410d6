//! Bootstraps OpenTelemetry tracing and metrics export.
//!
//! [`init_telemetry`] builds a batching trace pipeline and a periodic metric
//! pipeline that share one resource, and publishes them as the process-wide
//! providers. [`shutdown_telemetry`] (or [`Telemetry::shutdown`]) flushes and
//! stops both and puts inert providers back in their place.

pub mod config;
pub mod error;
pub mod resource;
mod statics;
pub mod telemetry;

pub use config::{
    CollectorEndpoint, EndpointError, ExporterKind, MetricTemporality, SamplingPolicy,
    TelemetryConfig, Transport,
};
pub use error::{FlushError, ShutdownError, Signal, TelemetryError};
pub use resource::build_resource;
pub use telemetry::{
    Telemetry, force_flush_telemetry, get_meter_provider, get_tracer_provider, init_telemetry,
    init_telemetry_with_exporters, meter, shutdown_telemetry, shutdown_telemetry_with_deadline,
    tracer,
};
