use crate::error::Error;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE_NAME: &str = "dandere2x_logfile.txt";

/// Console plus the append-only session log inside `logs_dir`.
pub fn init(logs_dir: &Path) -> Result<PathBuf, Error> {
    let path = logs_dir.join(LOG_FILE_NAME);
    let file = open_log_file(&path)?;

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let session_log = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false);

    // A subscriber may already be installed when running under a test harness.
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .with(session_log)
        .try_init();

    Ok(path)
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("DANDERE2X_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| Error::LogFile { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_logs_dir_is_a_log_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_log_file(&dir.path().join("absent").join(LOG_FILE_NAME));
        assert!(matches!(result, Err(Error::LogFile { .. })));
    }

    #[test]
    fn log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&path, "first run\n").unwrap();
        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "second run").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first run\nsecond run\n");
    }
}
