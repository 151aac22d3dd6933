//! Tracing/logging initialization.
//!
//! Filtering follows `RUST_LOG`; when it is unset or invalid the given default
//! directive applies. Every entry point is safe to call more than once: only
//! the first subscriber installed wins.

use tracing_subscriber::EnvFilter;

/// Output format for worker logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

impl LogFormat {
    /// Read `JOBRELAY_LOG_FORMAT` (`json` or `pretty`), defaulting to JSON.
    pub fn from_env() -> Self {
        match std::env::var("JOBRELAY_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// JSON logs at `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    init_with("info", LogFormat::from_env());
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_with(default_directive: &str, format: LogFormat) -> bool {
    let filter = filter(default_directive);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let installed = match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    };
    if installed {
        ::tracing::debug!(?format, "tracing initialised");
    }
    installed
}

/// Compact logs routed through the test harness's captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .compact()
        .try_init();
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init_for_tests();
        assert!(!init_with("info", LogFormat::Json));
    }
}
