//! Logging setup for embedding hosts
//!
//! The plugin logs through `tracing` and never installs a subscriber on its
//! own; hosts that want the bridge to own logging call [`setup_logging`]
//! once at startup. Console output is always on, file output is added when
//! the configuration names a log file.

use std::path::Path;

use tracing::{info, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};

/// Keeps the non-blocking file writer alive. Dropping it stops the
/// background flusher, so hold it for as long as the plugin runs.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn format_layer<S, W>(format: &LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Full => layer.boxed(),
    }
}

/// Install a global subscriber per the logging configuration.
///
/// Fails when the level is unknown, the log-file path is unusable, or the
/// host already installed a subscriber of its own.
pub fn setup_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| Error::config(format!("Invalid log level: {}", config.level)))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let (file_layer, file_guard) = match &config.file {
        Some(file) => {
            let path = Path::new(file);
            let prefix = path
                .file_name()
                .ok_or_else(|| Error::config(format!("Invalid log file path: {file}")))?;
            let directory = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            // Rotated daily, named after the configured file.
            let appender = rolling::daily(directory, prefix);
            let (writer, guard) = non_blocking(appender);
            (Some(format_layer(&config.format, writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(format_layer(&config.format, std::io::stdout))
        .try_init()
        .map_err(|e| Error::config(format!("Couldn't install the log subscriber: {e}")))?;

    info!("Logging initialized with level: {level}");
    Ok(LogGuard { _file: file_guard })
}
