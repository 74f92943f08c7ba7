use slog::Logger;
use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger from a TOML config string, falling back to the
/// default terminal config when none is supplied.
pub fn init(config: Option<&str>) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config.unwrap_or(DEFAULT_CONFIG))
        .expect("Malformed logger config");

    config.build_logger().expect("Logger construction failed")
}

/// A logger that swallows all records. Used in tests.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
