//! Subscriber installation for the binary.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter directive for `-v` flags; `None` keeps the configured level.
fn verbosity_level(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` wins over everything; otherwise `-v` flags win over the
/// configured level. Calling it twice leaves the first subscriber in place.
pub fn init(cfg: &LoggingConfig, verbose: u8) {
    let level = verbosity_level(verbose).unwrap_or(cfg.level.as_str());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
