use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::SdkTracerProvider};

#[derive(Clone)]
pub(crate) struct InstalledProviders {
    pub generation: u64,
    pub tracer: SdkTracerProvider,
    pub meter: SdkMeterProvider,
}

static INSTALLED_PROVIDERS: Mutex<Option<InstalledProviders>> = Mutex::new(None);
static GENERATION: AtomicU64 = AtomicU64::new(0);

// a panic while installing must not wedge every later init or shutdown
pub(crate) fn installed_providers() -> MutexGuard<'static, Option<InstalledProviders>> {
    INSTALLED_PROVIDERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed) + 1
}
