//! Tracing subscriber initialisation for the binary.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Environment variable consulted first for the log filter.
pub const LOG_ENV: &str = "KVTESTBED_LOG";

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a stderr `fmt` subscriber once per process.
///
/// The filter comes from `KVTESTBED_LOG`, then `RUST_LOG`, then the default
/// level (`debug` when `verbose`, otherwise `info`). Later calls are no-ops.
pub fn init_logging(verbose: bool) {
    LOGGING_INIT.get_or_init(|| {
        let directive = filter_directive(
            std::env::var(LOG_ENV).ok(),
            std::env::var("RUST_LOG").ok(),
            verbose,
        );
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .try_init();
        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    });
}

fn filter_directive(primary: Option<String>, fallback: Option<String>, verbose: bool) -> String {
    primary
        .into_iter()
        .chain(fallback)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| String::from(if verbose { "debug" } else { "info" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("trace"), Some("warn"), false, "trace")]
    #[case(Some("  "), Some("warn"), false, "warn")]
    #[case(None, None, false, "info")]
    #[case(None, None, true, "debug")]
    fn directive_prefers_dedicated_variable(
        #[case] primary: Option<&str>,
        #[case] fallback: Option<&str>,
        #[case] verbose: bool,
        #[case] expected: &str,
    ) {
        let directive = filter_directive(
            primary.map(str::to_owned),
            fallback.map(str::to_owned),
            verbose,
        );
        assert_eq!(directive, expected);
    }

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_logging(false);
        init_logging(true);
    }
}
