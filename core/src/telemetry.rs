// Logging setup for binaries and tests
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `TETHER_LOG_FORMAT=json` selects JSON, anything else plain text
    pub fn from_env() -> Self {
        match std::env::var("TETHER_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Initialize the global subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). Everything is written to
/// stderr; stdout is reserved for protocol frames when serving over stdio.
///
/// # Example
///
/// ```no_run
/// tether_core::telemetry::init_logging("tether-relay").ok();
/// ```
pub fn init_logging(service: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let format = LogFormat::from_env();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }

    info!(
        target: "telemetry",
        service = %service,
        format = ?format,
        "Logging initialized"
    );
    Ok(())
}

/// Best-effort subscriber for tests; repeated calls are ignored
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_without_panicking() {
        init_test_logging();
        init_test_logging();
        assert!(init_logging("test").is_err());
    }
}
