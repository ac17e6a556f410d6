use std::{env, process};

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{
    HOST_ARCH, HOST_NAME, OS_TYPE, PROCESS_EXECUTABLE_NAME, PROCESS_PID, PROCESS_RUNTIME_NAME,
    SERVICE_VERSION,
};

use crate::{config::TelemetryConfig, error::TelemetryError};

// not part of the semantic conventions
pub const ENVIRONMENT_KEY: &str = "environment";

/// Builds the resource shared by the trace and meter providers.
///
/// The SDK contributes the `telemetry.sdk.*` attributes and anything listed in
/// `OTEL_RESOURCE_ATTRIBUTES`; the configured service name always wins over
/// `OTEL_SERVICE_NAME`.
pub fn build_resource(config: &TelemetryConfig) -> Result<Resource, TelemetryError> {
    let host_name = hostname::get()
        .map_err(|source| TelemetryError::ResourceDetection {
            attribute: HOST_NAME,
            source,
        })?
        .to_string_lossy()
        .into_owned();

    let executable = env::current_exe().map_err(|source| TelemetryError::ResourceDetection {
        attribute: PROCESS_EXECUTABLE_NAME,
        source,
    })?;
    let executable_name = executable
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string_lossy().into_owned());

    let mut attributes = vec![
        KeyValue::new(ENVIRONMENT_KEY, config.environment.clone()),
        KeyValue::new(HOST_NAME, host_name),
        KeyValue::new(HOST_ARCH, env::consts::ARCH),
        KeyValue::new(OS_TYPE, env::consts::OS),
        KeyValue::new(PROCESS_PID, i64::from(process::id())),
        KeyValue::new(PROCESS_EXECUTABLE_NAME, executable_name),
        KeyValue::new(PROCESS_RUNTIME_NAME, "rust"),
    ];
    if let Some(version) = &config.service_version {
        attributes.push(KeyValue::new(SERVICE_VERSION, version.clone()));
    }

    Ok(Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(attributes)
        .build())
}

#[cfg(test)]
mod tests {
    use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

    use super::*;

    fn attribute(resource: &Resource, key: &str) -> Option<String> {
        resource
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, value)| value.to_string())
    }

    #[test]
    fn resource_carries_service_name_and_environment() {
        let config = TelemetryConfig::new("staging", "localhost:4317", "billing-svc");
        let resource = build_resource(&config).unwrap();

        assert_eq!(attribute(&resource, SERVICE_NAME).as_deref(), Some("billing-svc"));
        assert_eq!(attribute(&resource, ENVIRONMENT_KEY).as_deref(), Some("staging"));
        assert_eq!(attribute(&resource, SERVICE_VERSION), None);
    }

    #[test]
    fn resource_describes_host_process_and_sdk() {
        let config = TelemetryConfig::default().with_service_version("2.0.1");
        let resource = build_resource(&config).unwrap();

        assert_eq!(attribute(&resource, SERVICE_VERSION).as_deref(), Some("2.0.1"));
        assert_eq!(
            attribute(&resource, PROCESS_PID),
            Some(process::id().to_string())
        );
        assert_eq!(attribute(&resource, HOST_ARCH).as_deref(), Some(env::consts::ARCH));
        assert!(attribute(&resource, HOST_NAME).is_some_and(|name| !name.is_empty()));
        assert!(attribute(&resource, PROCESS_EXECUTABLE_NAME).is_some());
        assert_eq!(attribute(&resource, "telemetry.sdk.language").as_deref(), Some("rust"));
    }

    #[test]
    fn attributes_use_semantic_convention_keys() {
        let resource = build_resource(&TelemetryConfig::default().with_service_version("1.4.0")).unwrap();

        for key in [
            "service.name",
            "service.version",
            "host.name",
            "host.arch",
            "os.type",
            "process.pid",
            "process.executable.name",
            "process.runtime.name",
        ] {
            assert!(attribute(&resource, key).is_some(), "missing resource attribute {key}");
        }
        assert_eq!(attribute(&resource, "process.runtime.name").as_deref(), Some("rust"));
        assert_eq!(attribute(&resource, "os.type").as_deref(), Some(env::consts::OS));
    }
}
