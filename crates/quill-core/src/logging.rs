//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Builds the filter: `RUST_LOG` when set, otherwise `level`, otherwise `info`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber, writing to stderr.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(level: &str, json: bool) -> Result<(), TryInitError> {
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry().with(build_filter(level)).with(json_layer).with(text_layer).try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        // Malformed directives never abort startup.
        let filter = build_filter("not a [valid directive");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn test_init_twice_fails() {
        let _ = init_logging("debug", false);
        assert!(init_logging("debug", true).is_err());
    }
}
