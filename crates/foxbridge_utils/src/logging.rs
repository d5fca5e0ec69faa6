use std::str::FromStr;

use tracing::Level;

/// Initialize tracing for the application.
///
/// `default_level` is a level name ("error", "warn", "info", "debug",
/// "trace"); unrecognized values fall back to INFO. Uses `try_init` so tests
/// and libraries can call this more than once without panicking.
pub fn init(default_level: &str) {
    let level = Level::from_str(default_level).unwrap_or(Level::INFO);

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
