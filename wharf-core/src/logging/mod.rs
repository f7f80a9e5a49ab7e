//! Tracing bootstrap and the on-disk log sink.
//!
//! In [`LogMode::Stdout`] events are printed in the human `fmt` format. In
//! [`LogMode::File`] they are written as JSON lines through a
//! [`RotatingWriter`], which the returned [`LoggingGuard`] flushes and closes
//! on drop.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{
    EnvFilter, filter::ParseError, layer::SubscriberExt, util::SubscriberInitExt,
};

pub mod cleanup;
pub mod entries;
pub mod rotate;

pub use cleanup::{CleanupError, RetentionPolicy};
pub use entries::{LogEntry, read_entries};
pub use rotate::{CleanupCallback, RotateError, RotateOptions, RotatingWriter};

/// Filter used when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info,tower_http=warn";

/// Where log events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    #[default]
    Stdout,
    File,
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMode::Stdout => f.write_str("stdout"),
            LogMode::File => f.write_str("file"),
        }
    }
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdout" | "console" => Ok(LogMode::Stdout),
            "file" => Ok(LogMode::File),
            other => Err(format!("unknown log mode `{other}` (expected `stdout` or `file`)")),
        }
    }
}

/// Logging setup for the process.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Sink for log events.
    pub mode: LogMode,
    /// Active log file for [`LogMode::File`].
    pub file: PathBuf,
    /// Filter directive overriding `RUST_LOG`.
    pub level: Option<String>,
    /// Largest size in bytes of the active log file before it rotates.
    pub max_size: u64,
    /// What happens to rotated segments.
    pub retention: RetentionPolicy,
}

impl LoggingOptions {
    /// File-mode defaults: 4 MiB segments, six backups, compression on.
    pub fn new(mode: LogMode, file: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            file: file.into(),
            level: None,
            max_size: 4 << 20,
            retention: RetentionPolicy {
                max_backups: 6,
                max_age: None,
                compress: true,
            },
        }
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Some(level) = self.level.as_deref().filter(|level| !level.trim().is_empty()) {
            return Ok(EnvFilter::try_new(level)?);
        }
        Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
    }

    /// Writer for file mode, reporting cleanup failures as warnings.
    pub fn rotating_writer(&self) -> RotatingWriter {
        let callback: CleanupCallback = Arc::new(|err: &CleanupError| {
            tracing::warn!(error = %err, "log cleanup failed");
        });
        RotatingWriter::new(RotateOptions {
            path: self.file.clone(),
            max_size: self.max_size,
            retention: self.retention.clone(),
            header: None,
            on_cleanup_failed: Some(callback),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter")]
    Filter(#[from] ParseError),

    #[error("a global tracing subscriber is already installed")]
    Init(#[from] TryInitError),
}

/// Keeps the file sink alive; closes it when dropped.
#[derive(Debug, Default)]
pub struct LoggingGuard {
    writer: Option<RotatingWriter>,
}

impl LoggingGuard {
    /// The file sink, if logging to a file.
    pub fn writer(&self) -> Option<&RotatingWriter> {
        self.writer.as_ref()
    }
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.close();
        }
    }
}

/// Install the global subscriber.
pub fn init(options: &LoggingOptions) -> Result<LoggingGuard, LoggingError> {
    let filter = options.filter()?;

    match options.mode {
        LogMode::Stdout => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
            Ok(LoggingGuard::default())
        }
        LogMode::File => {
            let writer = options.rotating_writer();
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(writer.clone()),
                )
                .try_init()?;
            Ok(LoggingGuard {
                writer: Some(writer),
            })
        }
    }
}
