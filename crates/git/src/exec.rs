// crates/git/src/exec.rs
//! Whitelisted git execution.
//!
//! Commands are structured values from a closed set; every argument is
//! validated against a per-command shape before it reaches the argv.
//! Pathspecs are always preceded by `--` so nothing user-derived can be
//! parsed as an option.

use hindsight_core::ErrorClass;
use regex_lite::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard ceiling on any per-call timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(10);
/// Output ceiling; the child is killed when stdout exceeds this.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Stderr kept for diagnostics is bounded separately.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Fixed log format: hash|author|unix-time|subject.
const LOG_FORMAT: &str = "--format=%H|%an|%at|%s";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git operation timed out")]
    Timeout,

    #[error("git binary not found")]
    NotFound,

    #[error("git exited with status {code}: {stderr}")]
    NonZero { code: i32, stderr: String },

    #[error("git output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("rejected git argument: {reason}")]
    Rejected { reason: String },

    #[error("not a git repository: no .git found above the given path")]
    NotARepository,

    #[error("io error running git: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            // Spawn failures (EBADF under fd pressure) and timeouts retry.
            GitError::Timeout | GitError::Io(_) => ErrorClass::Transient,
            GitError::NotFound => ErrorClass::FatalProcess,
            GitError::Rejected { .. } => ErrorClass::PermanentCaller,
            GitError::NonZero { .. }
            | GitError::OutputTooLarge { .. }
            | GitError::NotARepository => ErrorClass::PermanentData,
        }
    }

    fn rejected(reason: impl Into<String>) -> GitError {
        GitError::Rejected {
            reason: reason.into(),
        }
    }
}

/// Target of a `rev-parse` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevTarget {
    Head,
    AbbrevRefHead,
    ShowToplevel,
    GitDir,
    /// Verify that a specific hash resolves.
    Verify(String),
}

/// The closed set of git operations the engine may perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    RemoteGetUrl { remote: String },
    BranchShowCurrent,
    BranchList { all: bool },
    BranchCreate { name: String, start_point: Option<String> },
    BranchDelete { name: String, force: bool },
    /// `git log` in the fixed hash|author|time|subject format, optionally
    /// path-filtered to a subdirectory.
    Log { limit: usize, subdir: Option<String> },
    /// `git show --stat --format=` for one commit.
    ShowStat { hash: String },
    StatusPorcelain { pathspec: Option<String> },
    RevParse { target: RevTarget },
    ConfigGet { key: String },
    DiffNameOnly { target: Option<String> },
    /// `git diff --stat`, optionally scoped to one pathspec.
    DiffStat { pathspec: Option<String> },
    Checkout { branch: String },
    Add { pathspec: String },
    Commit { message: String },
    StashPush,
    StashPop,
    Merge { branch: String },
}

impl GitCommand {
    /// Build the validated argv, or reject.
    pub fn to_args(&self) -> Result<Vec<String>, GitError> {
        let mut args: Vec<String> = Vec::new();
        match self {
            GitCommand::RemoteGetUrl { remote } => {
                validate_remote(remote)?;
                args.extend(strings(&["remote", "get-url", remote]));
            }
            GitCommand::BranchShowCurrent => {
                args.extend(strings(&["branch", "--show-current"]));
            }
            GitCommand::BranchList { all } => {
                args.extend(strings(&["branch", "--list", "--format=%(refname:short)"]));
                if *all {
                    args.push("--all".to_string());
                }
            }
            GitCommand::BranchCreate { name, start_point } => {
                validate_branch(name)?;
                args.extend(strings(&["branch", name]));
                if let Some(start) = start_point {
                    validate_ref(start)?;
                    args.push(start.clone());
                }
            }
            GitCommand::BranchDelete { name, force } => {
                validate_branch(name)?;
                args.push("branch".to_string());
                args.push(if *force { "-D" } else { "-d" }.to_string());
                args.push(name.clone());
            }
            GitCommand::Log { limit, subdir } => {
                args.extend(strings(&["log", LOG_FORMAT]));
                args.push(format!("-n{}", (*limit).clamp(1, 1000)));
                if let Some(subdir) = subdir {
                    validate_subdir(subdir)?;
                    args.push("--".to_string());
                    args.push(subdir.clone());
                }
            }
            GitCommand::ShowStat { hash } => {
                validate_hash(hash)?;
                args.extend(strings(&["show", "--stat", "--format=", hash]));
            }
            GitCommand::StatusPorcelain { pathspec } => {
                args.extend(strings(&["status", "--porcelain"]));
                if let Some(pathspec) = pathspec {
                    validate_pathspec(pathspec)?;
                    args.push("--".to_string());
                    args.push(pathspec.clone());
                }
            }
            GitCommand::RevParse { target } => {
                args.push("rev-parse".to_string());
                match target {
                    RevTarget::Head => args.push("HEAD".to_string()),
                    RevTarget::AbbrevRefHead => {
                        args.extend(strings(&["--abbrev-ref", "HEAD"]));
                    }
                    RevTarget::ShowToplevel => args.push("--show-toplevel".to_string()),
                    RevTarget::GitDir => args.push("--git-dir".to_string()),
                    RevTarget::Verify(hash) => {
                        validate_hash(hash)?;
                        args.extend(strings(&["--verify", hash]));
                    }
                }
            }
            GitCommand::ConfigGet { key } => {
                validate_config_key(key)?;
                args.extend(strings(&["config", "--get", key]));
            }
            GitCommand::DiffNameOnly { target } => {
                args.extend(strings(&["diff", "--name-only"]));
                if let Some(target) = target {
                    validate_ref(target)?;
                    args.push(target.clone());
                }
            }
            GitCommand::DiffStat { pathspec } => {
                args.extend(strings(&["diff", "--stat"]));
                if let Some(pathspec) = pathspec {
                    validate_pathspec(pathspec)?;
                    args.push("--".to_string());
                    args.push(pathspec.clone());
                }
            }
            GitCommand::Checkout { branch } => {
                validate_branch(branch)?;
                args.extend(strings(&["checkout", branch]));
            }
            GitCommand::Add { pathspec } => {
                validate_pathspec(pathspec)?;
                args.extend(strings(&["add", "--", pathspec]));
            }
            GitCommand::Commit { message } => {
                if message.trim().is_empty() {
                    return Err(GitError::rejected("empty commit message"));
                }
                args.extend(strings(&["commit", "-m", message]));
            }
            GitCommand::StashPush => {
                args.extend(strings(&["stash", "push", "--include-untracked"]));
            }
            GitCommand::StashPop => {
                args.extend(strings(&["stash", "pop"]));
            }
            GitCommand::Merge { branch } => {
                validate_branch(branch)?;
                args.extend(strings(&["merge", branch]));
            }
        }
        Ok(args)
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Argument shapes
// ============================================================================

fn hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9]{7,40}$").unwrap())
}

fn remote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn subdir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_./-]+$").unwrap())
}

fn config_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

fn validate_hash(hash: &str) -> Result<(), GitError> {
    if hash_re().is_match(hash) {
        Ok(())
    } else {
        Err(GitError::rejected("commit hash must be 7-40 lowercase hex"))
    }
}

fn validate_remote(remote: &str) -> Result<(), GitError> {
    if remote_re().is_match(remote) {
        Ok(())
    } else {
        Err(GitError::rejected("invalid remote name"))
    }
}

fn validate_subdir(subdir: &str) -> Result<(), GitError> {
    if !subdir_re().is_match(subdir) {
        return Err(GitError::rejected("invalid subdirectory path"));
    }
    if subdir.starts_with('/') || subdir.starts_with('-') || subdir.split('/').any(|c| c == "..") {
        return Err(GitError::rejected("subdirectory must be relative"));
    }
    Ok(())
}

/// Branch names follow git check-ref-format shape rules.
fn validate_branch(name: &str) -> Result<(), GitError> {
    let bad = name.is_empty()
        || name.starts_with('-')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("@{")
        || name
            .chars()
            .any(|c| c.is_control() || c == ' ' || c == '~' || c == '^' || c == ':' || c == '?' || c == '*' || c == '[' || c == '\\');
    if bad {
        Err(GitError::rejected("invalid branch name"))
    } else {
        Ok(())
    }
}

/// A ref argument: a hash or a branch-shaped name.
fn validate_ref(r: &str) -> Result<(), GitError> {
    if hash_re().is_match(r) || r == "HEAD" {
        return Ok(());
    }
    validate_branch(r)
}

/// Pathspecs are repo-relative and must not smuggle options or escape the
/// working tree. They always follow a `--` separator in the argv.
fn validate_pathspec(pathspec: &str) -> Result<(), GitError> {
    if pathspec.is_empty() {
        return Err(GitError::rejected("empty pathspec"));
    }
    if pathspec.starts_with('-') || pathspec.starts_with('/') {
        return Err(GitError::rejected("pathspec must be repo-relative"));
    }
    if pathspec.split('/').any(|c| c == "..") {
        return Err(GitError::rejected("pathspec must not traverse upward"));
    }
    if pathspec.contains('\0') {
        return Err(GitError::rejected("pathspec contains NUL"));
    }
    Ok(())
}

fn validate_config_key(key: &str) -> Result<(), GitError> {
    if config_key_re().is_match(key) {
        Ok(())
    } else {
        Err(GitError::rejected("invalid config key"))
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run a git command in `repo` with the default timeout.
pub async fn run_git(repo: &Path, command: &GitCommand) -> Result<String, GitError> {
    run_git_with_timeout(repo, command, DEFAULT_TIMEOUT).await
}

/// Run a git command with an explicit timeout (clamped to [`MAX_TIMEOUT`]).
///
/// Returns stdout as a lossily-decoded UTF-8 string. Stderr is captured and
/// folded into the error on nonzero exit. The child is killed on timeout or
/// when stdout exceeds [`MAX_OUTPUT_BYTES`].
pub async fn run_git_with_timeout(
    repo: &Path,
    command: &GitCommand,
    timeout: Duration,
) -> Result<String, GitError> {
    let args = command.to_args()?;
    let timeout = timeout.min(MAX_TIMEOUT);
    debug!(repo = %repo.display(), args = ?args, "running git");

    let mut child = Command::new("git")
        .args(&args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::NotFound
            } else {
                GitError::Io(e)
            }
        })?;

    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");

    // Drain both pipes concurrently. Exceeding the stdout ceiling kills the
    // child immediately; the pipes then hit EOF and the wait completes.
    let io = async {
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();
        let mut out_chunk = [0u8; 8192];
        let mut err_chunk = [0u8; 8192];
        let mut out_done = false;
        let mut err_done = false;
        let mut truncated = false;

        while !(out_done && err_done) {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if !out_done => match read {
                    Ok(0) | Err(_) => out_done = true,
                    Ok(n) => {
                        if !truncated {
                            out.extend_from_slice(&out_chunk[..n]);
                            if out.len() > MAX_OUTPUT_BYTES {
                                truncated = true;
                                let _ = child.start_kill();
                            }
                        }
                    }
                },
                read = stderr.read(&mut err_chunk), if !err_done => match read {
                    Ok(0) | Err(_) => err_done = true,
                    Ok(n) => {
                        if err.len() < MAX_STDERR_BYTES {
                            err.extend_from_slice(&err_chunk[..n]);
                        }
                    }
                },
            }
        }

        let status = child.wait().await;
        (out, err, truncated, status)
    };

    let (out, err, truncated, status) = match tokio::time::timeout(timeout, io).await {
        Ok(result) => result,
        Err(_) => {
            let _ = child.start_kill();
            return Err(GitError::Timeout);
        }
    };

    if truncated {
        return Err(GitError::OutputTooLarge {
            limit: MAX_OUTPUT_BYTES,
        });
    }
    let status = status?;

    if status.success() {
        Ok(String::from_utf8_lossy(&out).into_owned())
    } else {
        Err(GitError::NonZero {
            code: status.code().unwrap_or(-1),
            stderr: sanitize_stderr(&err),
        })
    }
}

/// Bound stderr and strip the home directory prefix so errors can travel to
/// logs and RPC responses without leaking absolute paths.
fn sanitize_stderr(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut text = text.trim().to_string();
    if let Some(home) = dirs::home_dir() {
        text = text.replace(&home.to_string_lossy().to_string(), "~");
    }
    if text.chars().count() > 300 {
        text = text.chars().take(300).collect();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_shapes() {
        assert!(validate_hash(&"a1b2c3d".to_string()).is_ok());
        assert!(validate_hash(&"a".repeat(40)).is_ok());
        assert!(validate_hash("A1B2C3D").is_err(), "uppercase rejected");
        assert!(validate_hash("abc").is_err(), "too short");
        assert!(validate_hash(&"a".repeat(41)).is_err(), "too long");
        assert!(validate_hash("zzzzzzz").is_err(), "non-hex");
    }

    #[test]
    fn remote_shapes() {
        assert!(validate_remote("origin").is_ok());
        assert!(validate_remote("up_stream-2").is_ok());
        assert!(validate_remote("bad remote").is_err());
        assert!(validate_remote("o;rm -rf").is_err());
    }

    #[test]
    fn subdir_shapes() {
        assert!(validate_subdir("ketchup").is_ok());
        assert!(validate_subdir("packages/web").is_ok());
        assert!(validate_subdir("../escape").is_err());
        assert!(validate_subdir("/abs").is_err());
        assert!(validate_subdir("-flag").is_err());
        assert!(validate_subdir("a b").is_err());
    }

    #[test]
    fn branch_shapes() {
        assert!(validate_branch("main").is_ok());
        assert!(validate_branch("shadow/main").is_ok());
        assert!(validate_branch("feature/auth-v2").is_ok());
        assert!(validate_branch("-evil").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("has space").is_err());
        assert!(validate_branch("tail.lock").is_err());
        assert!(validate_branch("ref@{0}").is_err());
        assert!(validate_branch("").is_err());
    }

    #[test]
    fn pathspec_shapes() {
        assert!(validate_pathspec("src/a.txt").is_ok());
        assert!(validate_pathspec("with space.txt").is_ok());
        assert!(validate_pathspec("-pretend-flag").is_err());
        assert!(validate_pathspec("/etc/passwd").is_err());
        assert!(validate_pathspec("../outside").is_err());
        assert!(validate_pathspec("").is_err());
    }

    #[test]
    fn commit_args_keep_message_as_single_argv_entry() {
        // Pipe characters in a message must survive as data — the source of
        // the shell-interpretation defect this layer exists to prevent.
        let cmd = GitCommand::Commit {
            message: "Auto-save: a.txt - shadow/main | extra".to_string(),
        };
        let args = cmd.to_args().unwrap();
        assert_eq!(args[0], "commit");
        assert_eq!(args[1], "-m");
        assert_eq!(args[2], "Auto-save: a.txt - shadow/main | extra");
    }

    #[test]
    fn add_always_uses_pathspec_separator() {
        let args = GitCommand::Add {
            pathspec: "src/a.txt".to_string(),
        }
        .to_args()
        .unwrap();
        assert_eq!(args, vec!["add", "--", "src/a.txt"]);
    }

    #[test]
    fn log_clamps_limit_and_filters_subdir() {
        let args = GitCommand::Log {
            limit: 5000,
            subdir: Some("ketchup".to_string()),
        }
        .to_args()
        .unwrap();
        assert!(args.contains(&"-n1000".to_string()));
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 1], "ketchup");
    }

    #[test]
    fn empty_commit_message_is_rejected() {
        let cmd = GitCommand::Commit {
            message: "   ".to_string(),
        };
        assert!(matches!(cmd.to_args(), Err(GitError::Rejected { .. })));
    }

    #[test]
    fn error_classes_drive_retry_policy() {
        assert_eq!(GitError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(
            GitError::rejected("x").class(),
            ErrorClass::PermanentCaller
        );
        assert_eq!(GitError::NotFound.class(), ErrorClass::FatalProcess);
        assert_eq!(
            GitError::NonZero {
                code: 128,
                stderr: String::new()
            }
            .class(),
            ErrorClass::PermanentData
        );
    }

    #[test]
    fn stderr_is_bounded_and_home_free() {
        let home = dirs::home_dir().unwrap();
        let raw = format!("fatal: cannot open {}/secret/repo", home.display());
        let sanitized = sanitize_stderr(raw.as_bytes());
        assert!(sanitized.contains("~/secret/repo"));
        assert!(!sanitized.contains(&home.to_string_lossy().to_string()));

        let long = "e".repeat(1000);
        assert_eq!(sanitize_stderr(long.as_bytes()).chars().count(), 300);
    }
}
