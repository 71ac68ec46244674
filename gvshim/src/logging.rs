//! Tracing setup for the shim binary.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Log file name inside `--log-dir`.
const LOG_FILE: &str = "gvshim.log";

fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize logging. `RUST_LOG` overrides the default level.
///
/// With `log_dir`, logs go to a daily rolling file through a non-blocking
/// writer; keep the returned guard alive until exit so buffered lines are
/// flushed. Otherwise logs go to stderr.
pub fn init(log_dir: Option<&Path>, debug: bool) -> std::io::Result<Option<WorkerGuard>> {
    let filter = env_filter(debug);

    let Some(log_dir) = log_dir else {
        if let Err(e) = tracing_subscriber::fmt()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init()
        {
            eprintln!("[ERROR] Failed to initialize tracing: {}", e);
        }
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }
    Ok(Some(guard))
}
