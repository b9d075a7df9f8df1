// crates/shadow/src/lib.rs
//! Shadow-commit engine: parallel-branch auto-commit history for local
//! repositories, correlated with AI sessions when the evidence supports it.

pub mod correlate;
pub mod engine;
pub mod gate;
pub mod notifications;
pub mod restore;

pub use correlate::{CorrelationHit, Correlator};
pub use engine::{
    cleanup_orphan_branches, compose_commit_message, run_commit_cycle, EventQueue, FileEvent,
    Limits, ShadowEngine,
};
pub use gate::{scan_for_secrets, Gate, SkipReason, DEFAULT_EXCLUDES};
pub use notifications::{NotificationRecord, NotificationSink};
pub use restore::{RestoreOutcome, RestorePlan, RestorePoints};

use hindsight_core::ErrorClass;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error(transparent)]
    Git(#[from] hindsight_git::GitError),

    #[error(transparent)]
    Store(#[from] hindsight_db::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("repository HEAD is detached; shadow commits need a branch")]
    DetachedHead,

    #[error("file content is identical to the shadow tip")]
    NothingToCommit,

    #[error("restore point label must not be empty")]
    InvalidLabel,

    #[error("restore point {id} not found")]
    UnknownRestorePoint { id: i64 },

    #[error("working tree left on shadow branch in {root}; repository disabled")]
    FatalRepository { root: String },

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl ShadowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ShadowError::Git(e) => e.class(),
            ShadowError::Store(e) => e.class(),
            ShadowError::Io(_) => ErrorClass::Transient,
            ShadowError::Watch(_) => ErrorClass::FatalProcess,
            ShadowError::DetachedHead | ShadowError::NothingToCommit => ErrorClass::PermanentData,
            ShadowError::InvalidLabel | ShadowError::UnknownRestorePoint { .. } => {
                ErrorClass::PermanentCaller
            }
            ShadowError::FatalRepository { .. } => ErrorClass::FatalRepository,
            ShadowError::ShuttingDown => ErrorClass::FatalProcess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_map_to_policy() {
        assert_eq!(
            ShadowError::NothingToCommit.class(),
            ErrorClass::PermanentData
        );
        assert_eq!(
            ShadowError::UnknownRestorePoint { id: 7 }.class(),
            ErrorClass::PermanentCaller
        );
        assert_eq!(
            ShadowError::FatalRepository {
                root: "/r".to_string()
            }
            .class(),
            ErrorClass::FatalRepository
        );
        assert!(ShadowError::Io(std::io::Error::other("x"))
            .class()
            .is_retryable());
    }
}
