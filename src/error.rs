//! Unified error type for the sift library.
//!
//! Library code uses `SiftError` while the CLI binary continues using
//! `anyhow::Result` for convenience and maps errors onto process exit codes.
//!
//! # Error Categories
//!
//! - **Io**: file system operations (open, read, write, mmap)
//! - **Corrupt**: invalid on-disk data (magic bytes, truncation, nonmonotone samples)
//! - **InvalidParameters**: bad build/query parameters (p, k, batch size, page size)
//! - **VersionMismatch**: an index written by an incompatible format version

use std::fmt;
use std::path::PathBuf;

/// Unified error type for the sift library.
#[derive(Debug)]
pub enum SiftError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid on-disk data (magic bytes, truncated payload, bad structure).
    Corrupt { path: PathBuf, detail: String },

    /// Invalid parameters or data invariants.
    InvalidParameters(String),

    /// Index format version not understood by this build.
    VersionMismatch { have: u32, want: u32 },
}

impl fmt::Display for SiftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiftError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            SiftError::Corrupt { path, detail } => {
                write!(f, "Corrupt data in '{}': {}", path.display(), detail)
            }
            SiftError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            SiftError::VersionMismatch { have, want } => {
                write!(
                    f,
                    "Index version mismatch: file has version {}, this build reads version {}",
                    have, want
                )
            }
        }
    }
}

impl std::error::Error for SiftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SiftError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SiftError {
    fn from(err: std::io::Error) -> Self {
        SiftError::Io {
            path: PathBuf::new(),
            operation: "unknown",
            source: err,
        }
    }
}

/// Convenience type alias for Results using SiftError.
pub type Result<T> = std::result::Result<T, SiftError>;

impl SiftError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        SiftError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create a corrupt-data error.
    pub fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        SiftError::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        SiftError::InvalidParameters(msg.into())
    }

    /// Process exit code for this error kind.
    ///
    /// 1 invalid arguments, 2 I/O failure, 3 index version mismatch.
    /// Corrupt artifacts surface as I/O-class failures (code 2); code 4 is
    /// reserved for internal assertions and produced by the binary itself.
    pub fn exit_code(&self) -> i32 {
        match self {
            SiftError::InvalidParameters(_) => 1,
            SiftError::Io { .. } => 2,
            SiftError::Corrupt { .. } => 2,
            SiftError::VersionMismatch { .. } => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = SiftError::io(
            "/data/corpus.cobs_idx",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/data/corpus.cobs_idx"));
        assert!(msg.contains("read"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_corrupt_error_display() {
        let err = SiftError::corrupt("/data/corpus.cobs_idx", "invalid magic bytes");
        let msg = err.to_string();
        assert!(msg.contains("/data/corpus.cobs_idx"));
        assert!(msg.contains("invalid magic bytes"));
    }

    #[test]
    fn test_version_mismatch_display() {
        let err = SiftError::VersionMismatch { have: 9, want: 1 };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SiftError::invalid("p out of range").exit_code(), 1);
        assert_eq!(
            SiftError::io(
                "/x",
                "open",
                std::io::Error::new(std::io::ErrorKind::Other, "boom")
            )
            .exit_code(),
            2
        );
        assert_eq!(SiftError::corrupt("/x", "truncated").exit_code(), 2);
        assert_eq!(SiftError::VersionMismatch { have: 2, want: 1 }.exit_code(), 3);
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = SiftError::io("/path", "open", io_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: SiftError = io_err.into();
        match err {
            SiftError::Io { operation, .. } => assert_eq!(operation, "unknown"),
            _ => panic!("Expected Io variant"),
        }
    }
}
