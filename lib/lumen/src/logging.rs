//! Logging facade over `slog`. Consumers hold a `Logger` and derive child
//! loggers with `log.new(o!(...))` so every record carries its owner's
//! context keys.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Build the root logger from a sloggers TOML snippet.
pub fn init_from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Build the default root logger: terminal output on stderr at info level.
/// The level can be raised by passing an explicit config to `init_from_toml`.
pub fn init() -> Logger {
    init_from_toml(DEFAULT_CONFIG).expect("Default logger config must parse")
}

/// A logger that swallows everything. Used by constructors that accept
/// `Option<&Logger>` when the caller passes `None`.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let log = init();
        info!(log, "logger built"; "context" => "test");
    }

    #[test]
    fn test_init_bad_toml() {
        assert!(init_from_toml("type = ").is_err());
    }

    #[test]
    fn test_discard() {
        let log = discard();
        trace!(log, "swallowed");
    }
}
