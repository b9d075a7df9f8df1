// crates/db/src/indexer.rs
//! Transcript discovery: scan → diff.
//!
//! The transcript tree is two levels deep: one opaque directory per
//! project, each holding `<session>.jsonl` files. Scanning collects size
//! and mtime for every session file; diffing against the stored indexer
//! state decides what actually needs re-parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::queries::IndexerEntry;

/// A discovered session file.
#[derive(Debug, Clone)]
pub struct TranscriptFile {
    pub path: PathBuf,
    pub size: u64,
    /// Unix mtime, seconds.
    pub modified_at: i64,
    /// Name of the containing project directory.
    pub project_dir: String,
}

/// Result of scanning the transcript tree.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<TranscriptFile>,
    pub project_count: usize,
}

/// Which discovered files need (re-)indexing.
#[derive(Debug, Default)]
pub struct DiffResult {
    pub changed: Vec<TranscriptFile>,
    pub unchanged: usize,
    /// Paths recorded in the store that no longer exist on disk.
    pub deleted: Vec<String>,
}

/// Enumerate all `.jsonl` session files under `base_dir`, two levels deep.
pub async fn scan_transcripts(base_dir: &Path) -> ScanResult {
    let mut result = ScanResult::default();

    let mut projects = match fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = ?base_dir, error = %e, "transcript directory not readable");
            return result;
        }
    };

    while let Ok(Some(project)) = projects.next_entry().await {
        let is_dir = project
            .file_type()
            .await
            .map(|ft| ft.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }

        let project_dir = project.file_name().to_string_lossy().to_string();
        let mut sessions = match fs::read_dir(project.path()).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = ?project.path(), error = %e, "project directory not readable");
                continue;
            }
        };

        let mut found_any = false;
        while let Ok(Some(session)) = sessions.next_entry().await {
            let path = session.path();
            if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
                continue;
            }
            let Ok(metadata) = fs::metadata(&path).await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let modified_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            found_any = true;
            result.files.push(TranscriptFile {
                path,
                size: metadata.len(),
                modified_at,
                project_dir: project_dir.clone(),
            });
        }

        if found_any {
            result.project_count += 1;
        }
    }

    result
}

/// Split scanned files into changed / unchanged against the stored state,
/// and report stored paths that vanished from disk.
pub fn diff_against_state(
    files: &[TranscriptFile],
    states: &HashMap<String, IndexerEntry>,
) -> DiffResult {
    let mut result = DiffResult::default();

    let on_disk: std::collections::HashSet<String> = files
        .iter()
        .map(|f| f.path.to_string_lossy().to_string())
        .collect();

    for file in files {
        let key = file.path.to_string_lossy().to_string();
        match states.get(&key) {
            Some(entry)
                if entry.file_size == file.size as i64
                    && entry.modified_at == file.modified_at =>
            {
                result.unchanged += 1;
            }
            _ => result.changed.push(file.clone()),
        }
    }

    result.deleted = states
        .keys()
        .filter(|path| !on_disk.contains(path.as_str()))
        .cloned()
        .collect();

    result
}
