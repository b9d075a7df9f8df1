// crates/core/src/paths.rs
//! Canonical storage locations.
//!
//! Single source of truth — no ad-hoc `dirs::home_dir().join(...)` anywhere
//! else. Both the engine and the GUI resolve the same paths from here.

use std::path::PathBuf;

/// App root: `~/.hindsight/`.
pub fn app_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join(".hindsight"))
}

/// SQLite database file: `~/.hindsight/ai-memory/conversations.db`.
pub fn db_path() -> Option<PathBuf> {
    app_dir().map(|d| d.join("ai-memory").join("conversations.db"))
}

/// Notifications sink consumed by the GUI: `~/.hindsight-notifications.json`.
pub fn notifications_path() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join(".hindsight-notifications.json"))
}

/// Default transcript directory written by the AI client: `~/.claude/projects/`.
pub fn transcripts_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join(".claude").join("projects"))
}

/// PID file written by `hindsight start`: `~/.hindsight/hindsight.pid`.
pub fn pid_path() -> Option<PathBuf> {
    app_dir().map(|d| d.join("hindsight.pid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_path_is_under_ai_memory() {
        let path = db_path().unwrap();
        assert!(path.to_string_lossy().contains(".hindsight"));
        assert!(path.to_string_lossy().ends_with("ai-memory/conversations.db"));
    }

    #[test]
    fn notifications_live_in_home() {
        let path = notifications_path().unwrap();
        assert!(path
            .to_string_lossy()
            .ends_with(".hindsight-notifications.json"));
    }

    #[test]
    fn transcripts_default_to_claude_projects() {
        let path = transcripts_dir().unwrap();
        assert!(path.to_string_lossy().ends_with(".claude/projects"));
    }
}
