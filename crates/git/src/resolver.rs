// crates/git/src/resolver.rs
//! Repository resolution with a short-lived cache.
//!
//! Given any filesystem path, find the repository root (authoritative via
//! `rev-parse --show-toplevel`), the subdirectory the path occupies inside
//! it, and best-effort remote/branch info. A project directory inside a
//! monorepo resolves to `(root, subdir)` — the root is never assumed to be
//! the project directory itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::exec::{run_git, GitCommand, GitError, RevTarget};

/// Cache entries survive this long before re-resolution.
const CACHE_TTL: Duration = Duration::from_secs(30);

/// What a filesystem path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRepo {
    /// Absolute repository root.
    pub root: PathBuf,
    /// Path of the input relative to the root; `"."` at the root itself.
    pub subdirectory: String,
    pub is_monorepo_subdirectory: bool,
    pub remote_url: Option<String>,
    pub current_branch: Option<String>,
}

struct CacheEntry {
    resolved: ResolvedRepo,
    at: Instant,
}

/// Path → repository resolver with a 30 s TTL cache.
#[derive(Default)]
pub struct RepoResolver {
    cache: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl RepoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `input` to its repository, using the cache when fresh.
    pub async fn resolve(&self, input: &Path) -> Result<ResolvedRepo, GitError> {
        if let Some(hit) = self.cached(input) {
            return Ok(hit);
        }

        let resolved = self.resolve_uncached(input).await?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                input.to_path_buf(),
                CacheEntry {
                    resolved: resolved.clone(),
                    at: Instant::now(),
                },
            );
        }
        Ok(resolved)
    }

    /// Drop every cached entry (used when settings change under us).
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    fn cached(&self, input: &Path) -> Option<ResolvedRepo> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(input)?;
        (entry.at.elapsed() < CACHE_TTL).then(|| entry.resolved.clone())
    }

    async fn resolve_uncached(&self, input: &Path) -> Result<ResolvedRepo, GitError> {
        // Walk up until a .git entry appears. A `.git` file (worktree or
        // submodule `gitdir:` indirection) counts — rev-parse resolves it.
        let start = nearest_dir(input);
        let candidate = find_git_anchor(&start).ok_or(GitError::NotARepository)?;

        let toplevel = run_git(
            &candidate,
            &GitCommand::RevParse {
                target: RevTarget::ShowToplevel,
            },
        )
        .await?;
        let root = PathBuf::from(toplevel.trim());

        let canonical_input = std::fs::canonicalize(&start).unwrap_or(start.clone());
        let canonical_root = std::fs::canonicalize(&root).unwrap_or(root.clone());
        let subdirectory = match canonical_input.strip_prefix(&canonical_root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => ".".to_string(),
        };
        let is_monorepo_subdirectory = subdirectory != ".";

        // Remote and branch are best-effort; absence is not an error.
        let remote_url = run_git(
            &root,
            &GitCommand::RemoteGetUrl {
                remote: "origin".to_string(),
            },
        )
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

        let current_branch = run_git(&root, &GitCommand::BranchShowCurrent)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        debug!(
            input = %input.display(),
            root = %root.display(),
            subdirectory = %subdirectory,
            "resolved repository"
        );

        Ok(ResolvedRepo {
            root,
            subdirectory,
            is_monorepo_subdirectory,
            remote_url,
            current_branch,
        })
    }
}

/// The closest existing directory at or above `input`.
fn nearest_dir(input: &Path) -> PathBuf {
    if input.is_dir() {
        return input.to_path_buf();
    }
    input
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| input.to_path_buf())
}

/// Walk upward looking for a `.git` entry (directory, or file carrying a
/// `gitdir:` pointer).
fn find_git_anchor(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start.to_path_buf());
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        current = dir.parent().map(|p| p.to_path_buf());
    }
    None
}
