pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build a logger from a TOML logger description as understood by
/// `sloggers`.
pub fn from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|e| e.to_string())?;
    config.build_logger().map_err(|e| e.to_string())
}

/// Build the default terminal logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logger configuration must be valid")
}

/// Resolve an optional parent logger into a usable child labelled with the
/// component name, falling back to a discarding root. Components take
/// `Into<Option<&Logger>>` so callers can pass a logger, `None`, or nothing
/// at all in tests.
pub fn component<'a, L: Into<Option<&'a Logger>>>(log: L, name: &'static str) -> Logger {
    match log.into() {
        Some(log) => log.new(o!("component" => name)),
        None => Logger::root(Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let log = from_toml(DEFAULT_CONFIG).unwrap();
        info!(log, "logger built");
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(from_toml("type = \"nonsense\"").is_err());
    }

    #[test]
    fn test_component_discard() {
        let log = component(None, "frame");
        trace!(log, "discarded");
    }
}
