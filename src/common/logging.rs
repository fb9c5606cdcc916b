//! Logging and tracing configuration
//!
//! The harness logs a compact stream to stdout and, when a log directory is
//! available, a detailed copy of every run to `harness.log`. Output captured
//! from managed processes is emitted under the `harness::output` target at
//! debug level, so `RUST_LOG=harness::output=debug` shows it live.

use std::path::PathBuf;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Name of the diagnostic log file inside the log directory
const LOG_FILE: &str = "harness.log";

/// Keeps the file writer flushing until dropped at the end of `main`
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
    pub path: Option<PathBuf>,
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("harness=debug,info")
        } else {
            EnvFilter::new("harness=info,warn")
        }
    })
}

/// Subscriber with the stdout layer and, when `file` is given, a detailed file layer
///
/// The file layer is an `Option` so both shapes share one subscriber type.
fn subscriber(verbose: bool, file: Option<NonBlocking>) -> impl Subscriber + Send + Sync + 'static {
    let file_layer = file.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let stdout_layer = fmt::layer()
        .with_target(verbose)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(file_layer)
        .with(stdout_layer)
}

/// Initialize tracing for a harness run (stdout + diagnostic log file)
///
/// Logs are controlled by the `RUST_LOG` environment variable. Falls back to
/// stdout only if the log directory cannot be created.
pub fn init(verbose: bool) -> LogGuard {
    let log_dir = match paths::ensure_log_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Warning: Could not create log directory: {}", e);
            None
        }
    };

    let (file, guard, path) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard), Some(dir.join(LOG_FILE)))
        }
        None => (None, None, None),
    };

    subscriber(verbose, file).init();

    LogGuard {
        _guard: guard,
        path,
    }
}

/// Initialize stdout-only tracing (used by the standalone echo server)
pub fn init_stdout() {
    tracing_subscriber::registry()
        .with(filter(false))
        .with(fmt::layer().with_target(false).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_layer_receives_events() {
        let dir = tempfile::tempdir().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        tracing::subscriber::with_default(subscriber(false, Some(writer)), || {
            tracing::warn!("injector did not exit cleanly");
        });
        drop(guard);

        let content = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert!(content.contains("injector did not exit cleanly"));
    }

    #[test]
    fn test_stdout_only_subscriber() {
        tracing::subscriber::with_default(subscriber(true, None), || {
            tracing::info!("no log file");
        });
    }
}
