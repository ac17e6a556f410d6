mod signal;

use std::{process::exit, time::Duration};

use log::{LevelFilter, error, info};
use opentelemetry::{
    KeyValue,
    trace::{Span, Tracer, TracerProvider},
};
use opentelemetry_appender_log::OpenTelemetryLogBridge;
use opentelemetry_sdk::{
    Resource,
    error::{OTelSdkError, OTelSdkResult},
    logs::{BatchLogProcessor, SdkLoggerProvider},
};
use opentelemetry_stdout::LogExporter;
use signal::{setup_sig_handler, shutdown_requested};
use telemetry_bootstrap::{TelemetryConfig, get_meter_provider, get_tracer_provider, init_telemetry};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

fn init_logger(service_name: &str) -> SdkLoggerProvider {
    let log_processor = BatchLogProcessor::builder(LogExporter::default()).build();
    let logger_provider = SdkLoggerProvider::builder()
        .with_log_processor(log_processor)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();
    let log_bridge = OpenTelemetryLogBridge::new(&logger_provider);

    if let Err(e) = log::set_boxed_logger(Box::new(log_bridge)) {
        eprintln!("Warning > Couldn't set up logger | {}", e);
    }
    log::set_max_level(LevelFilter::Info);

    logger_provider
}

// the log bridge is gone by now, so failures go to stderr
fn shutdown_logger(logger: SdkLoggerProvider) {
    if let Some(e) = logger_shutdown_error(logger.shutdown()) {
        eprintln!("Error > Logger shutdown failed | {}", e);
    }
}

fn logger_shutdown_error(result: OTelSdkResult) -> Option<OTelSdkError> {
    match result {
        Ok(_) | Err(OTelSdkError::AlreadyShutdown) => None,
        Err(e) => Some(e),
    }
}

#[tokio::main]
async fn main() {
    let config = match TelemetryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error > Invalid telemetry configuration | {}", e);
            exit(2);
        }
    };
    let logger_provider = init_logger(&config.service_name);

    if setup_sig_handler().is_err() {
        shutdown_logger(logger_provider);
        exit(1);
    }

    let telemetry = match init_telemetry(&config) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            error!(error = format!("{}", e).as_str(); "Could not initialize telemetry");
            shutdown_logger(logger_provider);
            exit(1);
        }
    };

    let tracer = get_tracer_provider().tracer("telemetry-demo");
    let heartbeats = get_meter_provider()
        .meter("telemetry-demo")
        .u64_counter("heartbeats")
        .with_description("Number of heartbeat spans emitted")
        .build();

    let mut beats: u64 = 0;
    while !shutdown_requested() {
        beats += 1;
        let mut span = tracer.start("heartbeat");
        span.set_attribute(KeyValue::new("beat", beats as i64));
        heartbeats.add(1, &[KeyValue::new("environment", config.environment.clone())]);
        span.end();

        tokio::time::sleep(HEARTBEAT_PERIOD).await;
    }
    info!(beats = beats; "Shutdown requested, flushing telemetry");

    match tokio::task::spawn_blocking(move || telemetry.shutdown_with_deadline(SHUTDOWN_DEADLINE))
        .await
    {
        Ok(Ok(())) => (),
        Ok(Err(e)) => eprintln!("Error > Telemetry shutdown failed | {}", e),
        Err(e) => eprintln!("Error > Telemetry shutdown task failed | {}", e),
    }

    shutdown_logger(logger_provider);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_shutdown_reports_only_real_failures() {
        assert!(logger_shutdown_error(Ok(())).is_none());
        assert!(logger_shutdown_error(Err(OTelSdkError::AlreadyShutdown)).is_none());
        assert!(matches!(
            logger_shutdown_error(Err(OTelSdkError::Timeout(Duration::from_secs(5)))),
            Some(OTelSdkError::Timeout(_))
        ));
        assert!(matches!(
            logger_shutdown_error(Err(OTelSdkError::InternalFailure("exporter gone".to_string()))),
            Some(OTelSdkError::InternalFailure(_))
        ));
    }

    #[test]
    fn stopping_the_logger_twice_is_quiet() {
        let logger = SdkLoggerProvider::builder().build();
        assert!(logger_shutdown_error(logger.shutdown()).is_none());
        assert!(logger_shutdown_error(logger.shutdown()).is_none());
    }
}
