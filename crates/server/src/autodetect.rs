// crates/server/src/autodetect.rs
//! Repository auto-detection at startup.
//!
//! Two sources: a small fixed set of developer roots under the home
//! directory (probed to a shallow depth), and the transcript tree (each
//! project's recorded cwd, when it still exists and is a repository).

use hindsight_core::sanitize_line;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directory names probed under the home directory.
const DEV_ROOTS: &[&str] = &["code", "src", "dev", "projects", "repos", "work"];
/// Probe depth below each developer root.
const MAX_DEPTH: usize = 3;
/// Lines read from a session file when extracting its cwd.
const HEAD_PROBE_LINES: usize = 10;

/// Scan the fixed developer roots for directories holding a `.git` entry.
pub fn detect_under_home(home: &Path) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();

    for root in DEV_ROOTS {
        let base = home.join(root);
        if !base.is_dir() {
            continue;
        }
        let mut walker = WalkDir::new(&base)
            .max_depth(MAX_DEPTH)
            .follow_links(false)
            .into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.path().join(".git").exists() {
                found.insert(entry.path().to_path_buf());
                // A repository's insides are not more repositories.
                walker.skip_current_dir();
            }
        }
    }

    found.into_iter().collect()
}

/// Derive candidate repositories from the transcript tree: the first cwd
/// recorded in the newest session file of each project directory.
pub async fn detect_from_transcripts(transcripts_dir: &Path) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();

    let Ok(mut projects) = tokio::fs::read_dir(transcripts_dir).await else {
        return Vec::new();
    };
    while let Ok(Some(project)) = projects.next_entry().await {
        let Ok(mut sessions) = tokio::fs::read_dir(project.path()).await else {
            continue;
        };

        let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;
        while let Ok(Some(session)) = sessions.next_entry().await {
            let path = session.path();
            if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
                continue;
            }
            let Ok(meta) = session.metadata().await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if newest.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
                newest = Some((path, modified));
            }
        }

        let Some((session_path, _)) = newest else {
            continue;
        };
        if let Some(cwd) = probe_cwd(&session_path).await {
            let candidate = PathBuf::from(cwd);
            if candidate.join(".git").exists() {
                found.insert(candidate);
            } else {
                debug!(path = %candidate.display(), "transcript cwd is not a repository");
            }
        }
    }

    found.into_iter().collect()
}

async fn probe_cwd(path: &Path) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    for _ in 0..HEAD_PROBE_LINES {
        let raw = lines.next_line().await.ok()??;
        let repaired = sanitize_line(&raw);
        let Ok(value) = serde_json::from_str::<serde_json::Value>(repaired.as_ref()) else {
            continue;
        };
        if let Some(cwd) = value.get("cwd").and_then(|v| v.as_str()) {
            if !cwd.is_empty() {
                return Some(cwd.to_string());
            }
        }
    }
    None
}
