// crates/shadow/src/correlate.rs
//! Conversation↔change correlation.
//!
//! Decides whether a file modification was caused by an active AI session
//! by scanning tool-use evidence in the tail of the most recently active
//! transcript for the repository. The score is a sum of weighted signals,
//! clamped to [0, 1]; anything under the floor is "no correlation".

use hindsight_core::{sanitize_line, tail_lines};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lines of transcript tail inspected for evidence.
const WINDOW_LINES: usize = 200;
/// How close a tool-use timestamp must be to the file event, in seconds.
const TIME_WINDOW_SECS: i64 = 10;
/// Minimum score for a correlation to be reported at all.
const MIN_CONFIDENCE: f64 = 0.3;

/// How many of the newest session files are probed for a matching cwd.
const CANDIDATE_LIMIT: usize = 10;
/// Lines read from the head of a candidate to find its cwd.
const HEAD_PROBE_LINES: usize = 10;

const WEIGHT_EXACT_PATH: f64 = 0.5;
const WEIGHT_BASENAME: f64 = 0.3;
const WEIGHT_TIME_WINDOW: f64 = 0.2;
const WEIGHT_CWD_ACTIVITY: f64 = 0.1;

/// A scored association between a file change and a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationHit {
    pub session_id: String,
    /// In [0, 1]; never below the reporting floor.
    pub confidence: f64,
    pub description: Option<String>,
}

/// Reads transcript tails to answer "did an AI session cause this change?".
pub struct Correlator {
    transcripts_dir: PathBuf,
}

impl Correlator {
    pub fn new(transcripts_dir: PathBuf) -> Self {
        Self { transcripts_dir }
    }

    /// Correlate a change to `rel_path` under `repo_root` observed at
    /// `event_unix`. Returns `None` when no session scores ≥ 0.3.
    pub async fn correlate(
        &self,
        repo_root: &Path,
        rel_path: &str,
        event_unix: i64,
    ) -> Option<CorrelationHit> {
        let candidate = self.latest_session_for_cwd(repo_root).await?;
        let lines = tail_lines(&candidate.path, WINDOW_LINES).await.ok()?;

        let basename = Path::new(rel_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())?;
        let abs_path = repo_root.join(rel_path).to_string_lossy().to_string();

        let mut exact = false;
        let mut name_match = false;
        let mut in_time_window = false;
        let mut any_tool_activity = false;

        for raw in &lines {
            let repaired = sanitize_line(raw);
            let Ok(value) = serde_json::from_str::<serde_json::Value>(repaired.as_ref()) else {
                continue;
            };
            let Some(parts) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            else {
                continue;
            };

            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                    continue;
                }
                any_tool_activity = true;

                let input_text = part
                    .get("input")
                    .map(|i| i.to_string())
                    .unwrap_or_default();
                if input_text.contains(&abs_path) || input_text.contains(rel_path) {
                    exact = true;
                }
                if input_text.contains(&basename) {
                    name_match = true;
                }

                if let Some(ts) = value
                    .get("timestamp")
                    .and_then(|t| t.as_str())
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                {
                    if (event_unix - ts.timestamp()).abs() <= TIME_WINDOW_SECS {
                        in_time_window = true;
                    }
                }
            }
        }

        let mut score = 0.0;
        if exact {
            score += WEIGHT_EXACT_PATH;
        }
        if name_match {
            score += WEIGHT_BASENAME;
        }
        if in_time_window {
            score += WEIGHT_TIME_WINDOW;
        }
        if candidate.cwd_subset() && any_tool_activity {
            score += WEIGHT_CWD_ACTIVITY;
        }
        let confidence = score.min(1.0);

        debug!(
            session = %candidate.session_id,
            confidence,
            exact,
            name_match,
            in_time_window,
            cwd_relation = ?candidate.relation,
            "correlation scored"
        );

        if confidence < MIN_CONFIDENCE {
            return None;
        }

        let description = if exact || name_match {
            Some(format!("Tool activity referenced {}", basename))
        } else {
            None
        };

        Some(CorrelationHit {
            session_id: candidate.session_id,
            confidence,
            description,
        })
    }

    /// Find the most recent session file whose cwd sits inside the
    /// repository: an exact-root cwd wins, a cwd under the root (a monorepo
    /// subdirectory session) is the fallback.
    async fn latest_session_for_cwd(&self, repo_root: &Path) -> Option<Candidate> {
        let mut sessions: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        let mut projects = tokio::fs::read_dir(&self.transcripts_dir).await.ok()?;
        while let Ok(Some(project)) = projects.next_entry().await {
            let Ok(mut entries) = tokio::fs::read_dir(project.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    if let Ok(meta) = entry.metadata().await {
                        if let Ok(modified) = meta.modified() {
                            sessions.push((path, modified));
                        }
                    }
                }
            }
        }

        sessions.sort_by(|a, b| b.1.cmp(&a.1));

        let root = repo_root.to_string_lossy().to_string();
        let mut subdirectory_fallback: Option<Candidate> = None;
        for (path, _) in sessions.into_iter().take(CANDIDATE_LIMIT) {
            let Some(candidate) = probe_head(&path, &root).await else {
                continue;
            };
            match candidate.relation {
                CwdRelation::Exact => return Some(candidate),
                CwdRelation::Under => {
                    if subdirectory_fallback.is_none() {
                        subdirectory_fallback = Some(candidate);
                    }
                }
            }
        }
        subdirectory_fallback
    }
}

/// How a session's cwd relates to the repository root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CwdRelation {
    /// cwd is the repository root itself.
    Exact,
    /// cwd is strictly under the root — a monorepo subdirectory session.
    Under,
}

fn cwd_relation(root: &str, cwd: &str) -> Option<CwdRelation> {
    if cwd == root {
        return Some(CwdRelation::Exact);
    }
    // Component boundary required: /R/ketchup is under /R, /R-other is not.
    cwd.strip_prefix(root)
        .filter(|rest| rest.starts_with('/'))
        .map(|_| CwdRelation::Under)
}

struct Candidate {
    path: PathBuf,
    session_id: String,
    relation: CwdRelation,
}

impl Candidate {
    /// The subset-relation signal: the session worked inside this repository.
    fn cwd_subset(&self) -> bool {
        matches!(self.relation, CwdRelation::Exact | CwdRelation::Under)
    }
}

/// Read the first few lines of a session file and classify its cwd against
/// the root. Sessions whose cwd is outside the repository yield `None`.
async fn probe_head(path: &Path, root: &str) -> Option<Candidate> {
    use tokio::io::AsyncBufReadExt;

    let file = tokio::fs::File::open(path).await.ok()?;
    let reader = tokio::io::BufReader::new(file);
    let mut lines = reader.lines();

    let mut session_id: Option<String> = None;
    let mut cwd: Option<String> = None;

    for _ in 0..HEAD_PROBE_LINES {
        let Ok(Some(raw)) = lines.next_line().await else {
            break;
        };
        let repaired = sanitize_line(&raw);
        let Ok(value) = serde_json::from_str::<serde_json::Value>(repaired.as_ref()) else {
            continue;
        };
        if session_id.is_none() {
            session_id = value
                .get("sessionId")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from);
        }
        if cwd.is_none() {
            cwd = value
                .get("cwd")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from);
        }
        if session_id.is_some() && cwd.is_some() {
            break;
        }
    }

    let relation = cwd_relation(root, &cwd?)?;

    let session_id = session_id.or_else(|| {
        path.file_stem().map(|s| s.to_string_lossy().to_string())
    })?;

    Some(Candidate {
        path: path.to_path_buf(),
        session_id,
        relation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn seed_session(dir: &Path, project: &str, name: &str, lines: &[String]) -> PathBuf {
        let project_dir = dir.join(project);
        tokio::fs::create_dir_all(&project_dir).await.unwrap();
        let path = project_dir.join(name);
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();
        path
    }

    fn tool_use_line(session: &str, cwd: &str, ts: &str, file_path: &str) -> String {
        format!(
            r#"{{"sessionId":"{session}","cwd":"{cwd}","timestamp":"{ts}","type":"assistant","message":{{"content":[{{"type":"tool_use","name":"Edit","input":{{"file_path":"{file_path}"}}}}]}}}}"#
        )
    }

    fn text_line(session: &str, cwd: &str, text: &str) -> String {
        format!(
            r#"{{"sessionId":"{session}","cwd":"{cwd}","type":"user","message":{{"content":"{text}"}}}}"#
        )
    }

    #[tokio::test]
    async fn exact_path_evidence_scores_high() {
        let dir = tempfile::tempdir().unwrap();
        let repo = "/home/me/ketchup";
        let event_ts = chrono::DateTime::parse_from_rfc3339("2026-07-01T09:00:05Z")
            .unwrap()
            .timestamp();

        seed_session(
            dir.path(),
            "-home-me-ketchup",
            "s1.jsonl",
            &[
                text_line("sess-1", repo, "fix the recipe"),
                tool_use_line(
                    "sess-1",
                    repo,
                    "2026-07-01T09:00:03Z",
                    "/home/me/ketchup/src/a.txt",
                ),
            ],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let hit = correlator
            .correlate(Path::new(repo), "src/a.txt", event_ts)
            .await
            .unwrap();

        assert_eq!(hit.session_id, "sess-1");
        // exact (0.5) + basename (0.3) + time window (0.2) + cwd (0.1), clamped
        assert_eq!(hit.confidence, 1.0);
        assert!(hit.description.unwrap().contains("a.txt"));
    }

    #[tokio::test]
    async fn basename_only_evidence_scores_lower() {
        let dir = tempfile::tempdir().unwrap();
        let repo = "/home/me/ketchup";
        // Tool touched a different directory's a.txt, long before the event.
        seed_session(
            dir.path(),
            "-home-me-ketchup",
            "s1.jsonl",
            &[tool_use_line(
                "sess-1",
                repo,
                "2026-07-01T08:00:00Z",
                "/elsewhere/a.txt",
            )],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let event_ts = chrono::DateTime::parse_from_rfc3339("2026-07-01T09:00:05Z")
            .unwrap()
            .timestamp();
        let hit = correlator
            .correlate(Path::new(repo), "src/a.txt", event_ts)
            .await
            .unwrap();

        // basename (0.3) + cwd with activity (0.1)
        assert!((hit.confidence - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unrelated_session_yields_no_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let repo = "/home/me/ketchup";
        seed_session(
            dir.path(),
            "-home-me-ketchup",
            "s1.jsonl",
            &[text_line("sess-1", repo, "just chatting, no tools")],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let hit = correlator.correlate(Path::new(repo), "src/a.txt", 0).await;
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn subdirectory_cwd_session_correlates_against_the_root() {
        // A monorepo: the repository is watched at /R, but the session ran
        // in /R/ketchup. The engine hands the correlator the top-level root
        // and a root-relative path.
        let dir = tempfile::tempdir().unwrap();
        let root = "/home/me/mono";
        let event_ts = chrono::DateTime::parse_from_rfc3339("2026-07-01T09:00:05Z")
            .unwrap()
            .timestamp();

        seed_session(
            dir.path(),
            "-home-me-mono-ketchup",
            "sub.jsonl",
            &[tool_use_line(
                "sess-sub",
                "/home/me/mono/ketchup",
                "2026-07-01T09:00:03Z",
                "/home/me/mono/ketchup/src/a.txt",
            )],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let hit = correlator
            .correlate(Path::new(root), "ketchup/src/a.txt", event_ts)
            .await
            .unwrap();

        assert_eq!(hit.session_id, "sess-sub");
        // exact path + basename + time window + cwd subset, clamped
        assert_eq!(hit.confidence, 1.0);
    }

    #[tokio::test]
    async fn exact_cwd_session_beats_a_newer_subdirectory_one() {
        let dir = tempfile::tempdir().unwrap();
        let root = "/home/me/mono";

        seed_session(
            dir.path(),
            "-home-me-mono",
            "root.jsonl",
            &[tool_use_line(
                "sess-root",
                root,
                "2026-07-01T09:00:03Z",
                "/home/me/mono/src/a.txt",
            )],
        )
        .await;
        // Written second, so it is the more recently modified file.
        seed_session(
            dir.path(),
            "-home-me-mono-ketchup",
            "sub.jsonl",
            &[tool_use_line(
                "sess-sub",
                "/home/me/mono/ketchup",
                "2026-07-01T09:00:03Z",
                "/home/me/mono/src/a.txt",
            )],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let event_ts = chrono::DateTime::parse_from_rfc3339("2026-07-01T09:00:05Z")
            .unwrap()
            .timestamp();
        let hit = correlator
            .correlate(Path::new(root), "src/a.txt", event_ts)
            .await
            .unwrap();

        assert_eq!(hit.session_id, "sess-root");
    }

    #[tokio::test]
    async fn sibling_path_cwd_is_not_a_subset() {
        // /home/me/mono-archive shares a string prefix with /home/me/mono
        // but is a different directory entirely.
        let dir = tempfile::tempdir().unwrap();
        seed_session(
            dir.path(),
            "-home-me-mono-archive",
            "s.jsonl",
            &[tool_use_line(
                "sess-sibling",
                "/home/me/mono-archive",
                "2026-07-01T09:00:03Z",
                "/home/me/mono-archive/src/a.txt",
            )],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let hit = correlator
            .correlate(Path::new("/home/me/mono"), "src/a.txt", 0)
            .await;
        assert_eq!(hit, None);
    }

    #[test]
    fn cwd_relation_classifies_exact_under_and_outside() {
        assert_eq!(
            cwd_relation("/home/me/mono", "/home/me/mono"),
            Some(CwdRelation::Exact)
        );
        assert_eq!(
            cwd_relation("/home/me/mono", "/home/me/mono/ketchup"),
            Some(CwdRelation::Under)
        );
        assert_eq!(cwd_relation("/home/me/mono", "/home/me/mono-archive"), None);
        assert_eq!(cwd_relation("/home/me/mono", "/home/me"), None);
    }

    #[tokio::test]
    async fn sessions_from_other_repos_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        seed_session(
            dir.path(),
            "-home-me-other",
            "s9.jsonl",
            &[tool_use_line(
                "sess-9",
                "/home/me/other",
                "2026-07-01T09:00:03Z",
                "/home/me/other/src/a.txt",
            )],
        )
        .await;

        let correlator = Correlator::new(dir.path().to_path_buf());
        let hit = correlator
            .correlate(Path::new("/home/me/ketchup"), "src/a.txt", 0)
            .await;
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn missing_transcripts_dir_is_no_correlation() {
        let correlator = Correlator::new(PathBuf::from("/nope/never"));
        let hit = correlator
            .correlate(Path::new("/home/me/ketchup"), "src/a.txt", 0)
            .await;
        assert_eq!(hit, None);
    }
}
