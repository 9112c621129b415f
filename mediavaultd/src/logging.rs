use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MEDIAVAULT_LOG";
const DEFAULT_LEVEL: &str = "info";
const QUIET_DEPENDENCIES: &str = "hyper=warn,reqwest=warn,sqlx=warn";

/// Builds the filter from a `MEDIAVAULT_LOG` value, falling back to `info`
/// when it is missing or unparsable.
pub fn filter_from(value: Option<&str>) -> EnvFilter {
    let base = value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_LEVEL);
    EnvFilter::try_new(format!("{base},{QUIET_DEPENDENCIES}"))
        .unwrap_or_else(|_| EnvFilter::new(format!("{DEFAULT_LEVEL},{QUIET_DEPENDENCIES}")))
}

pub fn init() {
    let value = std::env::var(LOG_ENV).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_from(value.as_deref()))
        .with_target(false)
        .try_init();
}
