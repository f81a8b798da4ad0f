//! Shared tracing/logging initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"ptyfleet_runner=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Log lines are written to stderr; stdout belongs to the console monitor.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the default filter directive for the binary and both crates at `level`.
pub fn default_filter(level: &str) -> String {
    format!("ptyfleet={level},ptyfleet_runner={level},ptyfleet_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_binary_and_crates() {
        assert_eq!(
            default_filter("debug"),
            "ptyfleet=debug,ptyfleet_runner=debug,ptyfleet_core=debug"
        );
    }
}
