//! Logging bootstrap shared by all crates in the workspace.
//!
//! Components hold a `Logger` handle; libraries accept `Into<Option<&Logger>>`
//! so hosts can opt out and get a discard logger instead.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::Config;
use sloggers::LoggerConfig;

/// Builds the default terminal logger.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Builds a logger from a TOML configuration file understood by `sloggers`.
pub fn init_from_file(path: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logger configuration file");

    config.build_logger().expect("Error building logger")
}

/// A logger that drops every record. Used as the default for components
/// constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives a component logger from an optional parent.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
