//! Diagnostic tracing for debugging tmt itself.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics selected by `-d`, `TMT_DEBUG` or
//!   `RUST_LOG`, written to stderr. Not part of the user-facing output.
//!
//! - **Printer (`io::output`)**: the `key: value` progress lines users read.
//!
//! - **Step logs (`<step>/log.txt`)**: subprocess transcripts kept in the
//!   workdir, always written regardless of the tracing level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable overriding the `-d` count.
pub const DEBUG_ENV: &str = "TMT_DEBUG";

/// Debug level from `-d` occurrences and an optional `TMT_DEBUG` value.
pub fn debug_level(flag_count: u8, env: Option<&str>) -> u8 {
    env.and_then(|raw| raw.trim().parse::<u8>().ok())
        .unwrap_or(flag_count)
}

/// Filter directive for a debug level.
pub fn directive(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level comes from [`debug_level`].
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// TMT_DEBUG=2 tmt run --all
/// RUST_LOG=tmt::steps=trace tmt run
/// ```
pub fn init(debug_flags: u8) {
    let level = debug_level(debug_flags, std::env::var(DEBUG_ENV).ok().as_deref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(level)));

    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_flag_count() {
        assert_eq!(debug_level(1, None), 1);
        assert_eq!(debug_level(1, Some("3")), 3);
        assert_eq!(debug_level(2, Some("junk")), 2);
    }

    #[test]
    fn levels_map_to_directives() {
        assert_eq!(directive(0), "warn");
        assert_eq!(directive(1), "info");
        assert_eq!(directive(2), "debug");
        assert_eq!(directive(7), "trace");
    }
}
