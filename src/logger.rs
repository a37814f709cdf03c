//! Logging initialisation via tracing-subscriber.
//!
//! The binary calls [`init_from_config`] once, after config is resolved.
//! Embedders that install their own subscriber never call this module.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::Config;
use crate::error::MarketplaceError;

/// Resolve the active filter.
///
/// With `prefer_level`, `level` wins and `RUST_LOG` is only a fallback for an
/// invalid `level`. Without it, `RUST_LOG` wins and `level` is the fallback.
fn build_filter(level: &str, prefer_level: bool) -> Result<EnvFilter, MarketplaceError> {
    if prefer_level {
        EnvFilter::try_new(level).or_else(|level_err| {
            EnvFilter::try_from_default_env().map_err(|env_err| {
                MarketplaceError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })
        })
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| MarketplaceError::Logger(format!("invalid log level '{level}': {e}")))
    }
}

/// Writer for log output: append to `log_file` when given, else stderr.
fn build_writer(log_file: Option<&Path>) -> Result<BoxMakeWriter, MarketplaceError> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    MarketplaceError::Logger(format!(
                        "failed to open log file '{}': {e}",
                        path.display()
                    ))
                })?;
            Ok(BoxMakeWriter::new(file))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}

/// Initialise the global tracing subscriber.
///
/// Fails with [`MarketplaceError::Logger`] if a global subscriber is already
/// installed.
pub fn init(level: &str, prefer_level: bool, log_file: Option<&Path>) -> Result<(), MarketplaceError> {
    let filter = build_filter(level, prefer_level)?;
    let writer = build_writer(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .try_init()
        .map_err(|e| MarketplaceError::Logger(format!("failed to set subscriber: {e}")))
}

/// Initialise from resolved config. `RUST_LOG`, when set, overrides the
/// configured level; the configured level must still be valid.
pub fn init_from_config(config: &Config) -> Result<(), MarketplaceError> {
    parse_level(&config.log_level)?;
    init(&config.log_level, false, config.log_file.as_deref())
}

/// Parse a log level string into a [`LevelFilter`], returning an error on
/// unrecognised values.
pub fn parse_level(level: &str) -> Result<LevelFilter, MarketplaceError> {
    if level.is_empty() {
        return Err(MarketplaceError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| MarketplaceError::Logger(format!("unrecognised log level: '{level}'")))
}
