use std::str::FromStr;

use tracing::Level;

/// Maps a configured level name to a `tracing` level. Unknown names fall
/// back to `INFO`.
pub fn parse_level(level: &str) -> Level {
    let level = level.trim();
    if level.eq_ignore_ascii_case("warning") {
        return Level::WARN;
    }
    Level::from_str(level).unwrap_or(Level::INFO)
}

/// Installs the global fmt subscriber, capped at `level`.
///
/// Only the first call takes effect; later calls (other tests, embedders)
/// are ignored.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init();
}
