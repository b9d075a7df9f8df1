// crates/shadow/tests/shadow_cycle.rs
//! Working-tree integration tests against real throwaway repositories:
//! the full commit cycle, the stash dance, orphan cleanup, and restore
//! points with their safety bookmarks.

use hindsight_db::{RepoSettings, Store};
use hindsight_shadow::{
    cleanup_orphan_branches, run_commit_cycle, Limits, RestorePoints, ShadowError,
};
use std::path::Path;
use std::process::Command;

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git available in test environment");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("src/a.txt"), "initial\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "initial commit"]);
}

#[tokio::test]
async fn commit_cycle_lands_on_shadow_branch_and_returns() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    // The user modifies a tracked file.
    std::fs::write(dir.path().join("src/a.txt"), "user edit\n").unwrap();

    let limits = Limits::default();
    let settings = RepoSettings::defaults_for(dir.path().to_string_lossy());
    let record = run_commit_cycle(&limits, dir.path(), Path::new("src/a.txt"), &settings, None)
        .await
        .unwrap();

    assert_eq!(record.shadow_branch, "shadow/main");
    assert_eq!(record.original_branch, "main");
    assert_eq!(record.commit_hash.len(), 40);
    assert!(record
        .message
        .starts_with("Auto-save: a.txt - shadow/main\n\n"));
    assert_eq!(record.files, vec!["src/a.txt".to_string()]);

    // Checkout is back on main.
    let branch = git(dir.path(), &["branch", "--show-current"]);
    assert_eq!(branch.trim(), "main");

    // The user's uncommitted edit survived the stash dance.
    let content = std::fs::read_to_string(dir.path().join("src/a.txt")).unwrap();
    assert_eq!(content, "user edit\n");

    // The shadow branch holds exactly one auto-save commit on top of the
    // initial commit, with the edited content.
    let shadow_log = git(dir.path(), &["log", "--format=%s", "shadow/main"]);
    let subjects: Vec<&str> = shadow_log.lines().collect();
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0], "Auto-save: a.txt - shadow/main");

    let shadow_content = git(dir.path(), &["show", "shadow/main:src/a.txt"]);
    assert_eq!(shadow_content, "user edit\n");

    // main history is untouched.
    let main_log = git(dir.path(), &["log", "--format=%s", "main"]);
    assert_eq!(main_log.lines().count(), 1);
}

#[tokio::test]
async fn unchanged_file_yields_nothing_to_commit() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let limits = Limits::default();
    let settings = RepoSettings::defaults_for(dir.path().to_string_lossy());

    // First cycle records the current content on the shadow branch.
    std::fs::write(dir.path().join("src/a.txt"), "edit one\n").unwrap();
    run_commit_cycle(&limits, dir.path(), Path::new("src/a.txt"), &settings, None)
        .await
        .unwrap();

    // A second cycle with identical content has nothing new to record.
    let second =
        run_commit_cycle(&limits, dir.path(), Path::new("src/a.txt"), &settings, None).await;
    assert!(matches!(second, Err(ShadowError::NothingToCommit)));

    let shadow_log = git(dir.path(), &["log", "--format=%s", "shadow/main"]);
    assert_eq!(shadow_log.lines().count(), 2, "initial + one auto-save");
}

#[tokio::test]
async fn repeated_edits_stack_on_the_shadow_branch() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let limits = Limits::default();
    let settings = RepoSettings::defaults_for(dir.path().to_string_lossy());

    for content in ["one\n", "two\n", "three\n"] {
        std::fs::write(dir.path().join("src/a.txt"), content).unwrap();
        run_commit_cycle(&limits, dir.path(), Path::new("src/a.txt"), &settings, None)
            .await
            .unwrap();
    }

    let shadow_log = git(dir.path(), &["log", "--format=%s", "shadow/main"]);
    assert_eq!(shadow_log.lines().count(), 4, "initial + three auto-saves");
    let content = git(dir.path(), &["show", "shadow/main:src/a.txt"]);
    assert_eq!(content, "three\n");

    // The user's tree still has the latest edit, uncommitted on main.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/a.txt")).unwrap(),
        "three\n"
    );
}

#[tokio::test]
async fn custom_branch_prefix_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let limits = Limits::default();
    let mut settings = RepoSettings::defaults_for(dir.path().to_string_lossy());
    settings.branch_prefix = "auto/".to_string();

    std::fs::write(dir.path().join("src/a.txt"), "prefixed\n").unwrap();
    let record = run_commit_cycle(&limits, dir.path(), Path::new("src/a.txt"), &settings, None)
        .await
        .unwrap();
    assert_eq!(record.shadow_branch, "auto/main");

    let branches = git(dir.path(), &["branch", "--list", "--format=%(refname:short)"]);
    assert!(branches.lines().any(|b| b.trim() == "auto/main"));
}

#[tokio::test]
async fn orphan_shadow_branches_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    // shadow/main has a live original; shadow/gone does not.
    git(dir.path(), &["branch", "shadow/main"]);
    git(dir.path(), &["branch", "shadow/gone"]);

    let limits = Limits::default();
    let removed = cleanup_orphan_branches(&limits, dir.path(), "shadow/")
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let branches = git(dir.path(), &["branch", "--list", "--format=%(refname:short)"]);
    let names: Vec<&str> = branches.lines().map(str::trim).collect();
    assert!(names.contains(&"shadow/main"));
    assert!(!names.contains(&"shadow/gone"));
}

#[tokio::test]
async fn restore_point_round_trip_with_safety() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let store_dir = tempfile::tempdir().unwrap();
    let store = Store::open(&store_dir.path().join("conversations.db"))
        .await
        .unwrap();
    let points = RestorePoints::new(store);

    let created = points
        .create(dir.path(), "before-refactor", "pre-refactor bookmark")
        .await
        .unwrap();
    let original_head = git(dir.path(), &["rev-parse", "HEAD"]);
    assert_eq!(created.commit_hash, original_head.trim());

    // Immediately previewing shows an empty change plan.
    let plan = points.preview(dir.path(), created.id).await.unwrap();
    assert!(plan.files_changed.is_empty());
    assert_eq!(plan.commands.len(), 1);
    assert!(plan.commands[0].starts_with("git checkout "));

    // Advance main with another commit, then preview again.
    std::fs::write(dir.path().join("src/a.txt"), "drifted\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "drift"]);

    let plan = points.preview(dir.path(), created.id).await.unwrap();
    assert_eq!(plan.files_changed, vec!["src/a.txt".to_string()]);

    // Restore: HEAD lands on the bookmarked hash and a safety point exists.
    let outcome = points.restore(dir.path(), created.id).await.unwrap();
    assert!(outcome.safety.label.starts_with("safety-"));

    let head = git(dir.path(), &["rev-parse", "HEAD"]);
    assert_eq!(head.trim(), created.commit_hash);

    let listed = points.list(dir.path(), 10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|p| p.label == "before-refactor"));
    assert!(listed.iter().any(|p| p.label.starts_with("safety-")));
}

#[tokio::test]
async fn restoring_unknown_point_is_a_caller_error() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let store_dir = tempfile::tempdir().unwrap();
    let store = Store::open(&store_dir.path().join("conversations.db"))
        .await
        .unwrap();
    let points = RestorePoints::new(store);

    let result = points.restore(dir.path(), 999).await;
    assert!(matches!(
        result,
        Err(ShadowError::UnknownRestorePoint { id: 999 })
    ));
}
