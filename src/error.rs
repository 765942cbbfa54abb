use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use image::error::ImageError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to process image: {0}")]
    Image(#[from] ImageError),
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("The {tool} executable was not found at {}", .path.display())]
    ToolNotFound { tool: &'static str, path: PathBuf },
    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}{}", .index.map(|i| format!(" while processing frame {}", i)).unwrap_or_default())]
    ToolFailed {
        tool: &'static str,
        index: Option<usize>,
        status: ExitStatus,
    },
    #[error("Could not create log file at {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} stage stalled for {}: produced {produced}, consumed {consumed}", humantime::format_duration(*.waited))]
    Stalled {
        stage: &'static str,
        produced: usize,
        consumed: usize,
        waited: Duration,
    },
    #[error("{stage} stage found a corrupt artifact at {}: {source}", .path.display())]
    CorruptArtifact {
        stage: &'static str,
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("Session was cancelled")]
    Cancelled,
    #[error("The {0} worker panicked")]
    WorkerPanicked(&'static str),
    #[error("Block matcher exited with {0}")]
    MatcherFailed(ExitStatus),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
