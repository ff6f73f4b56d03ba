use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::errors::Error;

fn level(config: &LoggingConfig) -> Level {
    match config.log_level.as_str() {
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber from the `[Logging]` config section.
/// `RUST_LOG` can still override individual targets.
pub fn init(config: &LoggingConfig) -> Result<(), Error> {
    let filter = EnvFilter::from_default_env().add_directive(level(config).into());

    if config.log_file.is_empty() {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if config.json {
            builder.json().init();
        } else {
            builder.init();
        }
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
        .map_err(|err| {
            Error::BadConfig(format!(
                "Failed to open log file {}: {err}",
                config.log_file
            ))
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
