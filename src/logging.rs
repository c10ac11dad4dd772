//! Tracing bootstrap.
//!
//! A calibration run is long-lived and usually unattended, so events go
//! both to stdout (for a live tail during commissioning) and to a
//! daily-rolling file under the configured directory. The file writer is
//! non-blocking; the returned guard flushes it on drop and must outlive
//! the run.

use std::fs;
use std::io;

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn default_dir() -> String {
    "logs".to_string()
}

fn default_file_prefix() -> String {
    "calforge.log".to_string()
}

fn default_filter() -> String {
    "info".to_string()
}

/// Log destination and verbosity, part of the run configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// Directory log files are written into.
    #[serde(default = "default_dir")]
    pub dir: String,

    /// File name prefix; the daily roller appends the date.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            file_prefix: default_file_prefix(),
            filter: default_filter(),
        }
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes the file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Installs the global subscriber: a compact file layer plus stdout.
///
/// File records are single-line so a run can be grepped by job id or
/// image type; ANSI colors go to the terminal only. `RUST_LOG` overrides
/// the configured filter. Call once per process, before the coordinator
/// starts.
pub fn init_logging(settings: &LogSettings) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(&settings.dir)?;

    let appender = tracing_appender::rolling::daily(&settings.dir, &settings.file_prefix);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .compact();
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
