use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Pretty stdout logging plus a plain-text log file for the job.
///
/// The level comes from `--log-level`, else `TRACING_LEVEL`, else `info`.
/// `LOG_FILE_PATH` overrides the job's log file. Keep the returned guard
/// alive until exit so buffered file output is flushed.
pub fn init_logger(level: Option<&str>, default_log_file: &Path) -> WorkerGuard {
    let filter = level
        .map(str::to_string)
        .or_else(|| env::var("TRACING_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter_layer = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = env::var("LOG_FILE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_log_file.to_path_buf());
    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let _ = fs::create_dir_all(directory);
    let file_name = log_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "dedup-tools.log".into());

    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter_layer)
        .init();

    info!("Logging to stdout and {}", log_file.display());

    guard
}
