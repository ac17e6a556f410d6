use std::{fmt, time::Duration};

use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Telemetry signal a pipeline carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Traces,
    Metrics,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Traces => f.write_str("traces"),
            Signal::Metrics => f.write_str("metrics"),
        }
    }
}

/// Errors raised while bringing the telemetry pipelines up.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create {signal} exporter for {endpoint}: {source}")]
    ExporterCreation {
        signal: Signal,
        endpoint: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to detect resource attribute {attribute}: {source}")]
    ResourceDetection {
        attribute: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Reserved for metric readers with a fallible start. The SDK's periodic
    /// reader spawns its collection thread infallibly, so nothing in this
    /// crate returns it today.
    #[error("failed to start metric collection: {0}")]
    CollectionStart(String),

    #[error("telemetry providers are already installed")]
    AlreadyInitialized,
}

/// Errors raised while tearing the telemetry pipelines down.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("telemetry providers were never installed")]
    NotInitialized,

    #[error("trace provider did not flush pending spans: {0}")]
    Flush(#[source] OTelSdkError),

    #[error("meter provider did not stop collection cleanly: {0}")]
    CollectionStop(#[source] OTelSdkError),

    #[error("trace flush failed ({flush}) and metric collection stop failed ({collection})")]
    Aggregate {
        flush: OTelSdkError,
        collection: OTelSdkError,
    },

    #[error("telemetry shutdown did not complete within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("telemetry shutdown thread failed: {0}")]
    ShutdownThread(String),
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("telemetry providers were never installed")]
    NotInitialized,

    #[error("force flush of {signal} failed: {source}")]
    Export {
        signal: Signal,
        #[source]
        source: OTelSdkError,
    },
}
