use crate::cli::TracingFormat;
use crate::config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

/// Build the default filter: dependencies at `warn`, this crate at `log_level`.
pub fn default_filter(log_level: &str) -> EnvFilter {
    EnvFilter::new(format!("warn,marketflow={log_level}"))
}

/// Configure and initialize logging for the application.
///
/// `RUST_LOG`, when set, replaces the configured filter entirely.
pub fn setup_logging(config: &Config, tracing_format: TracingFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&config.log_level));

    match tracing_format {
        TracingFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .compact(),
                )
                .init();
        }
        TracingFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .json()
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_span_events(FmtSpan::NONE),
                )
                .init();
        }
    }
}
