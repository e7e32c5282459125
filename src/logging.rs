//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events. Hosts that bring their own
//! subscriber never call into this module; binaries call [`try_init`].

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Builds the filter for `level`, letting `RUST_LOG` override it.
fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Installs a global fmt subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .init();
}

/// Installs a global fmt subscriber if none is installed yet.
///
/// Returns false when another subscriber already owns the global slot.
pub fn try_init(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Installs the compact, ANSI-free subscriber used inside worker containers.
pub fn try_init_worker(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(false)
        .with_ansi(false)
        .compact()
        .try_init()
        .is_ok()
}

/// Parses a level name (`trace`, `debug`, `info`, `warn`, `error`).
///
/// Unknown names fall back to `info`.
#[must_use]
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }
}
