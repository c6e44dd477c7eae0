//! Global `tracing` subscriber installation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Filter directive: `RUST_LOG` wins, then `debug` forces `debug`, then the
/// configured level.
fn build_filter(cfg: &LoggingConfig, debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if debug { "debug" } else { cfg.level.as_str() };
    EnvFilter::try_new(level).unwrap_or_else(|err| {
        eprintln!("invalid log level {level:?} ({err}), falling back to info");
        EnvFilter::new("info")
    })
}

/// Install the process-wide subscriber.
///
/// # Errors
/// Returns an error if a global subscriber is already set (tests, embedding
/// applications). The existing subscriber stays in place.
pub fn init_logging(cfg: &LoggingConfig, debug: bool) -> Result<(), TryInitError> {
    let fmt_layer = match cfg.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    Registry::default()
        .with(build_filter(cfg, debug))
        .with(fmt_layer)
        .try_init()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_overrides_configured_level() {
        temp_env::with_var_unset("RUST_LOG", || {
            let cfg = LoggingConfig {
                level: "warn".to_owned(),
                format: LogFormat::Text,
            };
            assert_eq!(build_filter(&cfg, true).to_string(), "debug");
            assert_eq!(build_filter(&cfg, false).to_string(), "warn");
        });
    }

    #[test]
    fn rust_log_wins() {
        temp_env::with_var("RUST_LOG", Some("svckit=trace"), || {
            let cfg = LoggingConfig::default();
            assert_eq!(build_filter(&cfg, true).to_string(), "svckit=trace");
        });
    }
}
