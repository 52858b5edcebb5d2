//! Logging setup: stdout plus a per-session log file
//!
//! `<log_dir>/session.log` is truncated at startup and written through a
//! non-blocking writer. The returned guard must live until exit so buffered
//! lines are flushed.

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// File name of the session log
pub const SESSION_LOG: &str = "session.log";

/// Default filter directive when `RUST_LOG` is unset
const DEFAULT_DIRECTIVE: &str = "roomtester=info";

/// Build the env filter; `RUST_LOG` adds to the default directive
pub fn env_filter() -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::from_default_env().add_directive(DEFAULT_DIRECTIVE.parse()?))
}

/// Create `log_dir` and truncate the session log inside it
pub fn open_session_log(log_dir: &Path) -> anyhow::Result<(File, PathBuf)> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(SESSION_LOG);
    let file = File::create(&path)?;
    Ok((file, path))
}

/// Install the global subscriber
pub fn init(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let (file, path) = open_session_log(log_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(env_filter()?)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .try_init()?;

    tracing::info!(path = %path.display(), "Session log opened");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_log_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let (_, path) = open_session_log(&log_dir).unwrap();
        std::fs::write(&path, "previous session\n").unwrap();

        let (_, path) = open_session_log(&log_dir).unwrap();
        assert_eq!(path, log_dir.join("session.log"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_env_filter_builds() {
        assert!(env_filter().is_ok());
    }
}
