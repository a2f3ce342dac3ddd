use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for FrankenRescue operations.
///
/// Variants map one-to-one onto the process exit statuses the tools commit
/// to: 0 normal, 1 environmental, 2 corrupt mapfile, 3 internal consistency
/// error, 128 + signum on signal.
#[derive(Error, Debug)]
pub enum RescueError {
    // === Argument / environment errors (exit 1) ===
    /// Invalid command-line argument or option combination.
    #[error("{detail}")]
    BadArgument { detail: String },

    /// A file or device could not be opened.
    #[error("cannot open '{path}': {source}")]
    CannotOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file exists but does not support positioned access.
    #[error("'{path}' is not seekable")]
    NotSeekable { path: PathBuf },

    /// File I/O error outside the rescue read loop.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write to the destination failed.
    ///
    /// Read errors on the source are expected and recorded in the map;
    /// write errors are fatal except in fill mode with
    /// `ignore_write_errors`.
    #[error("write failed at position {pos}: {source}")]
    WriteFailed {
        pos: u64,
        source: std::io::Error,
    },

    /// A mapfile is required for the requested mode but does not exist.
    #[error("mapfile '{path}' does not exist")]
    MapfileMissing { path: PathBuf },

    /// A rate, error-count, or timeout budget was exceeded.
    ///
    /// Behaves like an interrupt: the map is saved and the run stops
    /// cleanly, but the exit status is 1.
    #[error("rescue cancelled: {reason}")]
    Cancelled { reason: String },

    // === Corrupt mapfile (exit 2) ===
    /// The mapfile exists but cannot be understood.
    #[error("mapfile '{path}' is corrupt at line {line}: {detail}")]
    MapfileCorrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    // === Signal (exit 128 + signum) ===
    /// The run was interrupted by a signal. The map has been saved; the
    /// caller re-raises the signal so the shell sees the true cause.
    #[error("interrupted by signal {signum}")]
    Interrupted { signum: i32 },

    // === Internal errors (exit 3) ===
    /// Internal consistency error. Never recoverable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RescueError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BadArgument { .. }
            | Self::CannotOpen { .. }
            | Self::NotSeekable { .. }
            | Self::Io(_)
            | Self::WriteFailed { .. }
            | Self::MapfileMissing { .. }
            | Self::Cancelled { .. } => 1,
            Self::MapfileCorrupt { .. } => 2,
            Self::Interrupted { signum } => 128 + signum,
            Self::Internal(_) => 3,
        }
    }

    /// Whether this error is a clean stop (interrupt or budget trip) rather
    /// than a malfunction. Clean stops still save the mapfile.
    pub const fn is_clean_stop(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Interrupted { .. })
    }

    /// Create an argument error.
    pub fn bad_argument(detail: impl Into<String>) -> Self {
        Self::BadArgument {
            detail: detail.into(),
        }
    }

    /// Create a corrupt-mapfile error with a line diagnostic.
    pub fn corrupt(path: impl Into<PathBuf>, line: usize, detail: impl Into<String>) -> Self {
        Self::MapfileCorrupt {
            path: path.into(),
            line,
            detail: detail.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `RescueError`.
pub type Result<T> = std::result::Result<T, RescueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RescueError::corrupt("disk.map", 7, "blocks are not contiguous");
        assert_eq!(
            err.to_string(),
            "mapfile 'disk.map' is corrupt at line 7: blocks are not contiguous"
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RescueError::bad_argument("x").exit_code(), 1);
        assert_eq!(RescueError::cancelled("timeout").exit_code(), 1);
        assert_eq!(RescueError::corrupt("m", 1, "x").exit_code(), 2);
        assert_eq!(RescueError::internal("bug").exit_code(), 3);
        assert_eq!(RescueError::Interrupted { signum: 2 }.exit_code(), 130);
        assert_eq!(RescueError::Interrupted { signum: 15 }.exit_code(), 143);
    }

    #[test]
    fn clean_stops() {
        assert!(RescueError::cancelled("max errors").is_clean_stop());
        assert!(RescueError::Interrupted { signum: 2 }.is_clean_stop());
        assert!(!RescueError::internal("bug").is_clean_stop());
        assert!(!RescueError::bad_argument("x").is_clean_stop());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: RescueError = io_err.into();
        assert!(matches!(err, RescueError::Io(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn write_failed_display() {
        let err = RescueError::WriteFailed {
            pos: 4096,
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(err.to_string(), "write failed at position 4096: disk full");
    }
}
