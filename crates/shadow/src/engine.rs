// crates/shadow/src/engine.rs
//! The shadow-commit engine.
//!
//! One worker per repository owns every working-tree operation for that
//! repository; the notify callback only forwards events into a drop-oldest
//! queue and never blocks. The commit cycle snapshots the changed file,
//! stashes the user's dirty tree, commits the snapshot on the shadow
//! branch, and restores the original branch and stash. A cycle that leaves
//! the tree on the shadow branch after cleanup is the one fatal case: the
//! repository is disabled and the user is told.

use hindsight_db::{CorrelationRecord, RepoSettings, ShadowCommitRecord, Store};
use hindsight_git::{run_git, GitCommand, GitError, RepoResolver, RevTarget};
use notify::Watcher;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::correlate::{CorrelationHit, Correlator};
use crate::gate::Gate;
use crate::notifications::{NotificationRecord, NotificationSink};
use crate::ShadowError;

/// Event queue capacity per repository; overflow drops the oldest event.
const EVENT_QUEUE_CAPACITY: usize = 1024;
/// Retry policy for transient failures.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
/// Orphan shadow branches are swept this often.
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// Queue-drain ceiling during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Confidence at or above which the commit message uses the session wording.
const SESSION_CONFIDENCE_FLOOR: f64 = 0.8;

// ============================================================================
// Events
// ============================================================================

/// A file modification observed by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    /// Whether the underlying notify event was a create.
    pub created: bool,
    /// Unix seconds at observation.
    pub at_unix: i64,
}

/// Bounded drop-oldest queue feeding a repository worker.
///
/// `push` is synchronous and cheap: it runs on the notify callback thread,
/// which must never block.
pub struct EventQueue {
    inner: Mutex<VecDeque<FileEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn push(&self, event: FileEvent) {
        if let Ok(mut queue) = self.inner.lock() {
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> FileEvent {
        loop {
            if let Ok(mut queue) = self.inner.lock() {
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Throughput ceilings
// ============================================================================

/// Sliding-window rate cap. Runs on the tokio clock so paced waits and the
/// runtime's notion of time always agree.
pub struct RateWindow {
    max: usize,
    window: Duration,
    stamps: Mutex<VecDeque<tokio::time::Instant>>,
}

impl RateWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until another operation fits in the window, then record it.
    pub async fn pace(&self) {
        loop {
            let wait = {
                let Ok(mut stamps) = self.stamps.lock() else {
                    return;
                };
                let now = tokio::time::Instant::now();
                while stamps
                    .front()
                    .map(|t| now.duration_since(*t) >= self.window)
                    .unwrap_or(false)
                {
                    stamps.pop_front();
                }
                if stamps.len() < self.max {
                    stamps.push_back(now);
                    return;
                }
                self.window - now.duration_since(stamps[0])
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Global concurrency and rate ceilings shared by every repository worker.
/// These exist to keep subprocess and file-descriptor pressure bounded
/// under event bursts.
pub struct Limits {
    /// At most 2 git operations in flight across all repositories.
    pub git_ops: Semaphore,
    /// At most 5 gate/file operations in flight.
    pub file_ops: Semaphore,
    /// ≤ 10 git operations per second.
    pub git_rate: RateWindow,
    /// ≤ 20 file operations per 100 ms.
    pub file_rate: RateWindow,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            git_ops: Semaphore::new(2),
            file_ops: Semaphore::new(5),
            git_rate: RateWindow::new(10, Duration::from_secs(1)),
            file_rate: RateWindow::new(20, Duration::from_millis(100)),
        }
    }
}

/// A git call that honors the global rate cap. The concurrency permit is
/// held by the calling cycle.
async fn paced_git(
    limits: &Limits,
    repo: &Path,
    command: &GitCommand,
) -> Result<String, GitError> {
    limits.git_rate.pace().await;
    run_git(repo, command).await
}

// ============================================================================
// Commit cycle
// ============================================================================

/// Compose the fixed-format auto-save message.
pub fn compose_commit_message(
    basename: &str,
    shadow_branch: &str,
    description: &str,
    correlation: Option<&CorrelationHit>,
    timestamp_iso: &str,
) -> String {
    let mut message = format!("Auto-save: {basename} - {shadow_branch}\n\n{description}");
    if let Some(hit) = correlation {
        message.push_str(&format!(
            "\nSession: {}\nConfidence: {}%",
            hit.session_id,
            (hit.confidence * 100.0).round() as i64
        ));
    }
    message.push_str(&format!("\nTimestamp: {timestamp_iso}"));
    message
}

/// Run one full shadow-commit cycle for a single file.
///
/// Serialization contract: the caller is the repository's only worker —
/// nothing else touches this working tree concurrently.
pub async fn run_commit_cycle(
    limits: &Limits,
    repo_root: &Path,
    rel_path: &Path,
    settings: &RepoSettings,
    correlation: Option<CorrelationHit>,
) -> Result<ShadowCommitRecord, ShadowError> {
    let _cycle = limits
        .git_ops
        .acquire()
        .await
        .map_err(|_| ShadowError::ShuttingDown)?;

    let abs_path = repo_root.join(rel_path);
    let rel_str = rel_path.to_string_lossy().to_string();
    let basename = rel_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| rel_str.clone());

    // Snapshot the content up front: the stash that cleans the tree for the
    // branch switch would otherwise take the modification with it.
    let content = tokio::fs::read(&abs_path).await?;

    let original = paced_git(limits, repo_root, &GitCommand::BranchShowCurrent)
        .await?
        .trim()
        .to_string();
    if original.is_empty() {
        return Err(ShadowError::DetachedHead);
    }
    let shadow_branch = format!("{}{}", settings.branch_prefix, original);

    ensure_branch(limits, repo_root, &shadow_branch).await?;

    let on_original = original != shadow_branch;
    let mut stashed = false;
    let mut switched = false;

    if on_original {
        let dirty = !paced_git(limits, repo_root, &GitCommand::StatusPorcelain { pathspec: None })
            .await?
            .trim()
            .is_empty();
        if dirty {
            paced_git(limits, repo_root, &GitCommand::StashPush).await?;
            stashed = true;
        }
        if let Err(e) = paced_git(
            limits,
            repo_root,
            &GitCommand::Checkout {
                branch: shadow_branch.clone(),
            },
        )
        .await
        {
            if stashed {
                let _ = paced_git(limits, repo_root, &GitCommand::StashPop).await;
            }
            return Err(e.into());
        }
        switched = true;
    }

    let committed = commit_snapshot(
        limits,
        repo_root,
        rel_path,
        &abs_path,
        &content,
        &basename,
        &shadow_branch,
        correlation.as_ref(),
    )
    .await;

    // Whatever happened above, get the user back where they were. A failure
    // here is the one fatal-repository case.
    if switched {
        if let Err(restore_err) = paced_git(
            limits,
            repo_root,
            &GitCommand::Checkout {
                branch: original.clone(),
            },
        )
        .await
        {
            error!(
                repo = %repo_root.display(),
                error = %restore_err,
                "working tree stuck on shadow branch"
            );
            return Err(ShadowError::FatalRepository {
                root: repo_root.to_string_lossy().to_string(),
            });
        }
        if stashed {
            if let Err(e) = paced_git(limits, repo_root, &GitCommand::StashPop).await {
                warn!(repo = %repo_root.display(), error = %e, "stash pop failed after restore");
            }
        }
    }

    let (commit_hash, message) = committed?;

    Ok(ShadowCommitRecord {
        commit_hash,
        shadow_branch,
        original_branch: original,
        repo_root: repo_root.to_string_lossy().to_string(),
        files: vec![rel_str],
        message,
        session_id: correlation.as_ref().map(|c| c.session_id.clone()),
        confidence: correlation.as_ref().map(|c| c.confidence).unwrap_or(0.0),
        created_at: chrono::Utc::now().timestamp(),
    })
}

/// Create the shadow branch from the current tip if it does not exist yet.
async fn ensure_branch(limits: &Limits, repo: &Path, name: &str) -> Result<(), ShadowError> {
    match paced_git(
        limits,
        repo,
        &GitCommand::BranchCreate {
            name: name.to_string(),
            start_point: None,
        },
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(GitError::NonZero { stderr, .. }) if stderr.contains("already exists") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// On the shadow branch: write the snapshot, stage it, commit, read the hash.
#[allow(clippy::too_many_arguments)]
async fn commit_snapshot(
    limits: &Limits,
    repo_root: &Path,
    rel_path: &Path,
    abs_path: &Path,
    content: &[u8],
    basename: &str,
    shadow_branch: &str,
    correlation: Option<&CorrelationHit>,
) -> Result<(String, String), ShadowError> {
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(abs_path, content).await?;

    let rel_str = rel_path.to_string_lossy().to_string();

    let stat = paced_git(
        limits,
        repo_root,
        &GitCommand::DiffStat {
            pathspec: Some(rel_str.clone()),
        },
    )
    .await?;
    let stat_summary = stat
        .lines()
        .rev()
        .find(|l| l.contains("changed"))
        .map(|l| l.trim().to_string());

    let Some(stat_summary) = stat_summary else {
        // Identical to the shadow tip already; nothing to record.
        return Err(ShadowError::NothingToCommit);
    };

    let description = match correlation {
        Some(hit) if hit.confidence >= SESSION_CONFIDENCE_FLOOR => {
            "File modified during an AI-assisted session".to_string()
        }
        _ => stat_summary,
    };

    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let message =
        compose_commit_message(basename, shadow_branch, &description, correlation, &timestamp);

    paced_git(
        limits,
        repo_root,
        &GitCommand::Add {
            pathspec: rel_str.clone(),
        },
    )
    .await?;
    paced_git(
        limits,
        repo_root,
        &GitCommand::Commit {
            message: message.clone(),
        },
    )
    .await?;

    let hash = paced_git(
        limits,
        repo_root,
        &GitCommand::RevParse {
            target: RevTarget::Head,
        },
    )
    .await?
    .trim()
    .to_string();

    Ok((hash, message))
}

/// Delete shadow branches whose original branch is gone.
pub async fn cleanup_orphan_branches(
    limits: &Limits,
    repo_root: &Path,
    prefix: &str,
) -> Result<usize, ShadowError> {
    let listing = paced_git(limits, repo_root, &GitCommand::BranchList { all: false }).await?;
    let branches: std::collections::HashSet<String> = listing
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let mut removed = 0;
    for branch in &branches {
        let Some(original) = branch.strip_prefix(prefix) else {
            continue;
        };
        if branches.contains(original) {
            continue;
        }
        match paced_git(
            limits,
            repo_root,
            &GitCommand::BranchDelete {
                name: branch.clone(),
                force: true,
            },
        )
        .await
        {
            Ok(_) => {
                info!(repo = %repo_root.display(), branch = %branch, "deleted orphan shadow branch");
                removed += 1;
            }
            Err(e) => warn!(branch = %branch, error = %e, "failed to delete orphan shadow branch"),
        }
    }
    Ok(removed)
}

// ============================================================================
// Engine
// ============================================================================

struct RepoWorker {
    queue: Arc<EventQueue>,
    // Holding the subscription IS the "monitoring" state; dropping it
    // unsubscribes. There is no separate boolean to race on.
    _watcher: notify::RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

/// The engine: one watcher plus one serialized worker per repository.
pub struct ShadowEngine {
    store: Store,
    resolver: Arc<RepoResolver>,
    correlator: Arc<Correlator>,
    notifications: Option<NotificationSink>,
    limits: Arc<Limits>,
    workers: tokio::sync::Mutex<HashMap<String, RepoWorker>>,
    shutdown: CancellationToken,
}

impl ShadowEngine {
    pub fn new(
        store: Store,
        resolver: Arc<RepoResolver>,
        correlator: Arc<Correlator>,
        notifications: Option<NotificationSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            correlator,
            notifications,
            limits: Arc::new(Limits::default()),
            workers: tokio::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Register a repository: resolve it, persist settings and metadata,
    /// and start its worker when enabled.
    pub async fn add_repository(self: &Arc<Self>, path: &Path) -> Result<RepoSettings, ShadowError> {
        let resolved = self.resolver.resolve(path).await?;
        let root_str = resolved.root.to_string_lossy().to_string();

        self.store
            .upsert_repository(hindsight_db::RepositoryRecord {
                root: root_str.clone(),
                remote_url: resolved.remote_url.clone(),
                default_branch: resolved.current_branch.clone(),
                is_monorepo_subdirectory: resolved.is_monorepo_subdirectory,
                subdirectory: resolved
                    .is_monorepo_subdirectory
                    .then(|| resolved.subdirectory.clone()),
            })
            .await?;

        let settings = match self.store.repo_settings(&root_str).await? {
            Some(settings) => settings,
            None => {
                let settings = RepoSettings::defaults_for(root_str.clone());
                self.store.put_repo_settings(settings.clone()).await?;
                settings
            }
        };

        if settings.enabled {
            self.start_worker(resolved.root.clone(), settings.clone())
                .await?;
        }
        Ok(settings)
    }

    /// Stop watching a repository and drop its settings row.
    pub async fn remove_repository(&self, root: &Path) -> Result<bool, ShadowError> {
        let root_str = root.to_string_lossy().to_string();
        if let Some(worker) = self.workers.lock().await.remove(&root_str) {
            worker.task.abort();
        }
        Ok(self.store.remove_repo_settings(&root_str).await?)
    }

    /// Whether the filesystem subscription for `root` is currently active.
    pub async fn is_monitoring(&self, root: &Path) -> bool {
        self.workers
            .lock()
            .await
            .contains_key(root.to_string_lossy().as_ref())
    }

    pub async fn monitored_roots(&self) -> Vec<String> {
        self.workers.lock().await.keys().cloned().collect()
    }

    /// Events queued for a repository, not yet gated.
    pub async fn pending_events(&self, root: &Path) -> usize {
        self.workers
            .lock()
            .await
            .get(root.to_string_lossy().as_ref())
            .map(|w| w.queue.len())
            .unwrap_or(0)
    }

    async fn start_worker(
        self: &Arc<Self>,
        root: PathBuf,
        settings: RepoSettings,
    ) -> Result<(), ShadowError> {
        let root_str = root.to_string_lossy().to_string();
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&root_str) {
            return Ok(());
        }

        let queue = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let queue_for_watcher = queue.clone();

        // The notify callback runs on the OS watcher thread: forward and
        // return, nothing else.
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                let created = matches!(event.kind, notify::EventKind::Create(_));
                let relevant = created || matches!(event.kind, notify::EventKind::Modify(_));
                if !relevant {
                    return;
                }
                let at_unix = chrono::Utc::now().timestamp();
                for path in event.paths {
                    queue_for_watcher.push(FileEvent {
                        path,
                        created,
                        at_unix,
                    });
                }
            },
        )?;
        watcher.watch(&root, notify::RecursiveMode::Recursive)?;

        let engine = self.clone();
        let worker_root = root.clone();
        let worker_queue = queue.clone();
        let task = tokio::spawn(async move {
            engine.worker_loop(worker_root, settings, worker_queue).await;
        });

        info!(repo = %root.display(), "shadow worker started");
        workers.insert(
            root_str,
            RepoWorker {
                queue,
                _watcher: watcher,
                task,
            },
        );
        Ok(())
    }

    async fn worker_loop(
        self: Arc<Self>,
        root: PathBuf,
        settings: RepoSettings,
        queue: Arc<EventQueue>,
    ) {
        let mut gate = Gate::new(&settings);
        let mut orphan_sweep = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
        orphan_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = orphan_sweep.tick() => {
                    if let Err(e) =
                        cleanup_orphan_branches(&self.limits, &root, &settings.branch_prefix).await
                    {
                        warn!(repo = %root.display(), error = %e, "orphan sweep failed");
                    }
                }
                event = queue.pop() => {
                    if self
                        .handle_event(&root, &settings, &mut gate, event)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
            }
        }
        debug!(repo = %root.display(), "shadow worker stopped");
    }

    async fn handle_event(
        &self,
        root: &Path,
        settings: &RepoSettings,
        gate: &mut Gate,
        event: FileEvent,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        let Ok(rel) = event.path.strip_prefix(root) else {
            return ControlFlow::Continue(());
        };
        let rel = rel.to_path_buf();

        // The repository's own metadata is never commit material, and our
        // commit cycles generate .git churn of their own.
        if rel.components().any(|c| c.as_os_str() == ".git") {
            return ControlFlow::Continue(());
        }

        // Directory events never gate.
        match tokio::fs::metadata(&event.path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return ControlFlow::Continue(()),
        }

        let Ok(_file_permit) = self.limits.file_ops.acquire().await else {
            return ControlFlow::Break(());
        };
        self.limits.file_rate.pace().await;

        let tracked = || async {
            match self.is_tracked(root, &rel).await {
                Ok(tracked) => tracked,
                Err(e) => {
                    // A failed probe is treated as untracked: skip, never
                    // guess at committing.
                    warn!(error = %e, "tracking probe failed");
                    false
                }
            }
        };
        if let Some(reason) = gate.evaluate(&rel, &event.path, event.created, tracked).await {
            debug!(repo = %root.display(), file = %rel.display(), reason = reason.as_str(), "gated");
            return ControlFlow::Continue(());
        }

        let correlation = self
            .correlator
            .correlate(root, &rel.to_string_lossy(), event.at_unix)
            .await;

        match self
            .commit_with_retry(root, &rel, settings, correlation)
            .await
        {
            Ok(record) => {
                gate.record_commit(&rel);
                let correlation_row = record.session_id.as_ref().map(|sid| CorrelationRecord {
                    session_id: sid.clone(),
                    commit_hash: record.commit_hash.clone(),
                    repo_root: record.repo_root.clone(),
                    confidence: record.confidence,
                    created_at: record.created_at,
                });
                if let Err(e) = self
                    .store
                    .record_shadow_commit(record.clone(), correlation_row)
                    .await
                {
                    warn!(error = %e, "failed to persist shadow commit");
                }
                self.notify_commit(root, settings, &record).await;
                ControlFlow::Continue(())
            }
            Err(ShadowError::NothingToCommit) | Err(ShadowError::DetachedHead) => {
                ControlFlow::Continue(())
            }
            Err(ShadowError::FatalRepository { root: repo }) => {
                error!(repo = %repo, "disabling repository after fatal working-tree failure");
                let _ = self.store.set_repo_enabled(&repo, false).await;
                if let Some(sink) = &self.notifications {
                    sink.record(NotificationRecord {
                        timestamp: chrono::Utc::now()
                            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        kind: "repository-disabled".to_string(),
                        repository: repo_name(root),
                        file: rel.to_string_lossy().to_string(),
                        branch: String::new(),
                        commit_hash: String::new(),
                        session_id: None,
                    })
                    .await;
                }
                ControlFlow::Break(())
            }
            Err(e) => {
                warn!(repo = %root.display(), file = %rel.display(), error = %e, "shadow commit failed");
                ControlFlow::Continue(())
            }
        }
    }

    async fn is_tracked(&self, root: &Path, rel: &Path) -> Result<bool, GitError> {
        let status = paced_git(
            &self.limits,
            root,
            &GitCommand::StatusPorcelain {
                pathspec: Some(rel.to_string_lossy().to_string()),
            },
        )
        .await?;
        Ok(!status.starts_with("??"))
    }

    async fn commit_with_retry(
        &self,
        root: &Path,
        rel: &Path,
        settings: &RepoSettings,
        correlation: Option<CorrelationHit>,
    ) -> Result<ShadowCommitRecord, ShadowError> {
        let mut attempt = 0u32;
        loop {
            match run_commit_cycle(&self.limits, root, rel, settings, correlation.clone()).await {
                Ok(record) => return Ok(record),
                Err(e) if e.class().is_retryable() && attempt < MAX_RETRIES => {
                    let backoff = backoff_with_jitter(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient shadow-commit failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify_commit(&self, root: &Path, settings: &RepoSettings, record: &ShadowCommitRecord) {
        let Some(sink) = &self.notifications else {
            return;
        };
        if settings.notify_mode == hindsight_db::NotifyMode::Disabled {
            return;
        }
        sink.record(NotificationRecord {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            kind: "shadow-commit".to_string(),
            repository: repo_name(root),
            file: record.files.first().cloned().unwrap_or_default(),
            branch: record.shadow_branch.clone(),
            commit_hash: record.commit_hash.clone(),
            session_id: record.session_id.clone(),
        })
        .await;
    }

    /// Stop watchers first, drain workers up to the ceiling, then abort.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut workers = std::mem::take(&mut *self.workers.lock().await);

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        for (root, worker) in workers.drain() {
            // Dropping the watcher stops new events immediately.
            drop(worker._watcher);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, worker.task).await.is_err() {
                warn!(repo = %root, "worker did not drain before shutdown ceiling");
            }
        }
        info!("shadow engine stopped");
    }
}

fn repo_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repository".to_string())
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = RETRY_BASE * 2u32.saturating_pow(attempt);
    let capped = base.min(RETRY_CAP);
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 250)
        .unwrap_or(0);
    capped + Duration::from_millis(jitter_ms)
}
