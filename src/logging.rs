//! Tracing subscriber setup.
//!
//! Filtering follows `HOSTKIT_LOG` (an `EnvFilter` directive, `warn` when
//! unset). When `HOSTKIT_LOG_FILE` names a file, events are also written
//! there through a non-blocking appender.

use camino::Utf8Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the filter directive.
pub const LOG_FILTER_ENV: &str = "HOSTKIT_LOG";

/// Environment variable naming an additional log file.
pub const LOG_FILE_ENV: &str = "HOSTKIT_LOG_FILE";

/// Keeps the file writer alive; buffered lines flush when dropped.
#[derive(Debug)]
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Installs the global subscriber.
///
/// Call once from `main` and hold the guard until exit. A second call leaves
/// the first subscriber in place.
#[must_use]
pub fn init() -> LogGuard {
    let log_file = std::env::var(LOG_FILE_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty());

    let Some(raw_path) = log_file else {
        if let Err(err) = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
        {
            tracing::debug!(error = %err, "subscriber already installed");
        }
        return LogGuard { _file_guard: None };
    };

    let path = Utf8Path::new(&raw_path);
    let dir = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().unwrap_or("hostkit.log");
    if let Err(err) = std::fs::create_dir_all(dir) {
        tracing::warn!(dir = %dir, error = %err, "failed to create log directory");
    }
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    if let Err(err) = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
    {
        tracing::debug!(error = %err, "subscriber already installed");
    }

    LogGuard {
        _file_guard: Some(guard),
    }
}
