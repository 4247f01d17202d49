//! Subscriber setup for binaries. The library itself only emits `tracing`
//! events and never installs a subscriber.

use std::str::FromStr;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Builds the filter for `level`.
///
/// A bare level such as `debug` applies to this workspace's crates only;
/// anything containing `,` or `=` is used verbatim as a directive string.
#[must_use]
pub fn filter_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains(',') || level.contains('=') {
        level.to_string()
    } else {
        format!("warn,tandem_core={level},tandem_engine={level},tandem_demo={level}")
    }
}

/// Install a global subscriber.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn setup_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let directives = filter_directives(level);
    let filter = EnvFilter::from_str(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(false).with_current_span(true))
            .try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().with_target(true).with_thread_names(true).compact())
            .try_init()?,
    }

    tracing::debug!(filter = %directives, ?format, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_scopes_to_workspace() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("tandem_engine=debug"));
    }

    #[test]
    fn directives_pass_through() {
        assert_eq!(filter_directives(" info,tandem_core=trace "), "info,tandem_core=trace");
    }
}
