//! Daemon log output.
//!
//! Logs always go to stderr. With a log directory they are also written to a
//! daily-rotated `kiln-daemon.log` there. `KILN_LOG`, then `RUST_LOG`,
//! replace the level-derived filter entirely.

use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_ENV: &str = "KILN_LOG";

const LOG_FILE: &str = "kiln-daemon.log";

/// Targets the level applies to; everything else stays at `warn`
const KILN_TARGETS: [&str; 3] = ["kiln_daemon", "kiln_core", "kiln_rpc"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub level: LogLevel,
    /// Directory for the rotated log file
    pub dir: Option<PathBuf>,
}

/// Filter directives for `level` when no environment override is set.
#[must_use]
pub fn directives(level: LogLevel) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(KILN_TARGETS.iter().map(|t| format!("{t}={}", level.as_str())));
    directives.join(",")
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(directives(level)))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
pub fn init(options: &LogOptions) -> std::io::Result<Option<WorkerGuard>> {
    let verbose = options.level >= LogLevel::Debug;

    let (file_layer, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(options.level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .with(file_layer)
        .init();

    if let Some(dir) = &options.dir {
        tracing::info!("Logging to {}", dir.join(LOG_FILE).display());
    }
    Ok(guard)
}
