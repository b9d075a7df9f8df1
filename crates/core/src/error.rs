// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Stable failure classification shared by every subsystem.
///
/// The class decides policy: `Transient` failures are retried with backoff,
/// `Permanent*` failures are surfaced or skipped depending on who caused
/// them, `Fatal*` failures disable the affected unit or the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff: `SQLITE_BUSY`, subprocess timeout, spawn `EBADF`.
    Transient,
    /// Caller supplied bad input: invalid RPC params, unknown label.
    PermanentCaller,
    /// The data itself is bad: corrupt transcript line, invalid repository.
    PermanentData,
    /// The store is beyond repair: migration failure, post-rebuild corruption.
    PermanentStore,
    /// A working tree was left in a state requiring manual intervention.
    FatalRepository,
    /// The process cannot continue: watcher API gone, out of memory.
    FatalProcess,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::PermanentCaller => "permanent-caller",
            ErrorClass::PermanentData => "permanent-data",
            ErrorClass::PermanentStore => "permanent-store",
            ErrorClass::FatalRepository => "fatal-repository",
            ErrorClass::FatalProcess => "fatal-process",
        }
    }

    /// Whether the retry policy applies to this class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while reading a transcript file.
///
/// Per-line decode failures are NOT errors — they are counted and skipped
/// inside the parser. Only whole-file conditions surface here.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("transcript not found: {path}")]
    NotFound { path: PathBuf },

    #[error("permission denied reading transcript: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ParseError::NotFound { .. } | ParseError::PermissionDenied { .. } => {
                ErrorClass::PermanentData
            }
            ParseError::Io { .. } => ErrorClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let err = ParseError::io(
            "/t/a.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, ParseError::NotFound { .. }));
        assert_eq!(err.class(), ErrorClass::PermanentData);

        let err = ParseError::io(
            "/t/a.jsonl",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, ParseError::PermissionDenied { .. }));

        let err = ParseError::io(
            "/t/a.jsonl",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"),
        );
        assert!(matches!(err, ParseError::Io { .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn class_names_are_stable() {
        assert_eq!(ErrorClass::Transient.as_str(), "transient");
        assert_eq!(ErrorClass::PermanentCaller.as_str(), "permanent-caller");
        assert_eq!(ErrorClass::PermanentData.as_str(), "permanent-data");
        assert_eq!(ErrorClass::PermanentStore.as_str(), "permanent-store");
        assert_eq!(ErrorClass::FatalRepository.as_str(), "fatal-repository");
        assert_eq!(ErrorClass::FatalProcess.as_str(), "fatal-process");
    }

    #[test]
    fn only_transient_retries() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::PermanentData.is_retryable());
        assert!(!ErrorClass::FatalRepository.is_retryable());
    }
}
