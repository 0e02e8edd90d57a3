use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::core::config::LoggingConfig;

/// Parse a textual level, defaulting to INFO for anything unrecognised
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global fmt subscriber.
///
/// Returns `false` when a global subscriber was already set, which happens
/// when several coordinators share one process (tests, the example binary).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&config.level))
        .with_target(config.with_target)
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
