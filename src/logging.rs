//! Logging setup for keel.
//!
//! Every keel crate logs through `tracing`. Hosts that already install a
//! subscriber need nothing from this module; otherwise, with the
//! `tracing-subscriber` feature enabled, [`init`] installs one driven by
//! environment variables:
//!
//! - `KEEL_DEBUG=true|1|yes` - debug level
//! - `KEEL_LOG_LEVEL=trace|debug|info|warn|error` - explicit level
//! - `KEEL_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! ```rust,no_run
//! keel::logging::init();
//! ```

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Whether `KEEL_DEBUG` is set to a truthy value.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("KEEL_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Level from `KEEL_LOG_LEVEL`, falling back to `debug` under `KEEL_DEBUG`
/// and `warn` otherwise.
pub fn get_log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var("KEEL_LOG_LEVEL") {
        Ok(level) => match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// Format from `KEEL_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    env::var("KEEL_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

/// The `EnvFilter` directive covering every keel crate at `level`.
pub fn filter_directive(level: &str) -> String {
    ["keel", "keel_sqlite", "keel_schema", "keel_migrate", "keel_optimize"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber once. Later calls are no-ops.
///
/// Does nothing unless `KEEL_DEBUG` or `KEEL_LOG_LEVEL` is set, or when the
/// `tracing-subscriber` feature is off.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var("KEEL_LOG_LEVEL").is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = get_log_level();
            let filter = EnvFilter::try_new(filter_directive(level))
                .unwrap_or_else(|_| EnvFilter::new("warn"));

            // `try_init` so a subscriber installed by the host wins.
            let installed = match get_log_format() {
                "compact" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact())
                    .try_init(),
                "pretty" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().pretty())
                    .try_init(),
                _ => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init(),
            };

            if installed.is_ok() {
                tracing::info!(
                    level = level,
                    format = get_log_format(),
                    "keel logging initialized"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            env::remove_var("KEEL_DEBUG");
            env::remove_var("KEEL_LOG_LEVEL");
            env::remove_var("KEEL_LOG_FORMAT");
        }
        assert!(!is_debug_enabled());
        assert_eq!(get_log_level(), "warn");
        assert_eq!(get_log_format(), "json");
        init();
    }

    #[test]
    fn test_filter_directive() {
        let directive = filter_directive("debug");
        assert!(directive.starts_with("keel=debug,"));
        assert!(directive.contains("keel_migrate=debug"));
        assert_eq!(directive.split(',').count(), 5);
    }
}
