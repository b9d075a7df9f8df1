// crates/shadow/src/restore.rs
//! Restore points: named commit bookmarks with one-step recovery.
//!
//! `restore` is deliberately conservative: it creates an automatic safety
//! point first, and the checkout it issues is the plain form that refuses
//! to clobber uncommitted or untracked work.

use hindsight_db::{RestorePointRow, Store};
use hindsight_git::{run_git, GitCommand, RevTarget};
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::ShadowError;

/// What a restore would do, without doing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePlan {
    pub restore_point: RestorePointRow,
    /// Files that differ between the working tree and the point.
    pub files_changed: Vec<String>,
    /// The commands a restore would issue, in order.
    pub commands: Vec<String>,
}

/// Result of an executed restore.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub restored: RestorePointRow,
    pub safety: RestorePointRow,
}

/// Restore-point operations over one store and the git executor.
#[derive(Clone)]
pub struct RestorePoints {
    store: Store,
}

impl RestorePoints {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Capture the current HEAD under `label`. Labels are unique per repo.
    pub async fn create(
        &self,
        repo_root: &Path,
        label: &str,
        description: &str,
    ) -> Result<RestorePointRow, ShadowError> {
        if label.trim().is_empty() {
            return Err(ShadowError::InvalidLabel);
        }

        let head = run_git(
            repo_root,
            &GitCommand::RevParse {
                target: RevTarget::Head,
            },
        )
        .await?;
        let commit_hash = head.trim().to_string();

        let root = repo_root.to_string_lossy().to_string();
        let id = self
            .store
            .create_restore_point(&root, label, &commit_hash, description)
            .await?;

        info!(repo = %root, label, hash = %commit_hash, "restore point created");

        Ok(RestorePointRow {
            id,
            repo_root: root,
            label: label.to_string(),
            commit_hash,
            description: description.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    pub async fn list(
        &self,
        repo_root: &Path,
        limit: i64,
    ) -> Result<Vec<RestorePointRow>, ShadowError> {
        let root = repo_root.to_string_lossy().to_string();
        Ok(self.store.restore_points(&root, limit).await?)
    }

    /// Plan a restore: which files would change, which commands would run.
    pub async fn preview(&self, repo_root: &Path, id: i64) -> Result<RestorePlan, ShadowError> {
        let root = repo_root.to_string_lossy().to_string();
        let point = self
            .store
            .restore_point(&root, id)
            .await?
            .ok_or(ShadowError::UnknownRestorePoint { id })?;

        let diff = run_git(
            repo_root,
            &GitCommand::DiffNameOnly {
                target: Some(point.commit_hash.clone()),
            },
        )
        .await?;
        let files_changed: Vec<String> = diff
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let commands = vec![format!("git checkout {}", point.commit_hash)];

        Ok(RestorePlan {
            restore_point: point,
            files_changed,
            commands,
        })
    }

    /// Restore the working tree to a point's commit.
    ///
    /// A `safety-<unix>` point is created first so the pre-restore state
    /// stays reachable; the checkout never force-deletes untracked changes.
    pub async fn restore(&self, repo_root: &Path, id: i64) -> Result<RestoreOutcome, ShadowError> {
        let root = repo_root.to_string_lossy().to_string();
        let point = self
            .store
            .restore_point(&root, id)
            .await?
            .ok_or(ShadowError::UnknownRestorePoint { id })?;

        let safety_label = format!("safety-{}", chrono::Utc::now().timestamp());
        let safety = self
            .create(repo_root, &safety_label, "Automatic safety point before restore")
            .await?;

        run_git(
            repo_root,
            &GitCommand::Checkout {
                branch: point.commit_hash.clone(),
            },
        )
        .await?;

        info!(repo = %root, label = %point.label, hash = %point.commit_hash, "restored");

        Ok(RestoreOutcome {
            restored: point,
            safety,
        })
    }
}
