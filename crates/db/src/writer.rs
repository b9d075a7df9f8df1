// crates/db/src/writer.rs
//! The single-writer actor.
//!
//! One dedicated thread owns the write connection. Callers submit a
//! [`WriteJob`] over a bounded channel and await the result on a oneshot.
//! Eligible jobs are batched inside one transaction up to a soft row
//! ceiling; `SQLITE_BUSY` rolls back and retries with exponential backoff.
//! A permanent failure inside a batch falls back to per-job transactions so
//! one bad job cannot sink its neighbors.

use hindsight_core::{ConversationRecord, MessageRecord};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::migrations::apply_migrations;
use crate::queries::{self, CorrelationRecord, RepoSettings, RepositoryRecord, ShadowCommitRecord};
use crate::StoreError;

/// Soft ceiling on rows written per transaction.
const MAX_BATCH_ROWS: usize = 50;
/// Submit-side queue capacity; senders block (await) when full.
const QUEUE_CAPACITY: usize = 256;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 100;

/// A write operation accepted by the writer actor.
#[derive(Debug)]
pub enum WriteJob {
    /// Upsert the conversation and replace its message set, atomically.
    IndexTranscript {
        conversation: ConversationRecord,
        messages: Vec<MessageRecord>,
    },
    /// Persist a shadow commit and, when present, its correlation.
    RecordShadowCommit {
        commit: ShadowCommitRecord,
        correlation: Option<CorrelationRecord>,
    },
    UpsertRepository(RepositoryRecord),
    PutRepoSettings(RepoSettings),
    RemoveRepoSettings { root: String },
    SetRepoEnabled { root: String, enabled: bool },
    CreateRestorePoint {
        repo_root: String,
        label: String,
        commit_hash: String,
        description: String,
    },
    PutIndexerState {
        source_path: String,
        file_size: i64,
        modified_at: i64,
    },
    RemoveIndexerStates { source_paths: Vec<String> },
}

impl WriteJob {
    /// Approximate row weight, used for batch sizing.
    fn rows(&self) -> usize {
        match self {
            WriteJob::IndexTranscript { messages, .. } => 1 + messages.len(),
            WriteJob::RemoveIndexerStates { source_paths } => source_paths.len().max(1),
            _ => 1,
        }
    }
}

/// Result payload of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Done,
    /// Row id of a created restore point.
    Id(i64),
    /// For jobs that report whether a row existed.
    Existed(bool),
}

struct WriteRequest {
    job: WriteJob,
    reply: oneshot::Sender<Result<WriteOutcome, StoreError>>,
}

/// Cheap handle for submitting jobs to the writer thread.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
    generation: Arc<AtomicU64>,
}

impl WriterHandle {
    pub(crate) async fn submit(&self, job: WriteJob) -> Result<WriteOutcome, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest { job, reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Bumped whenever the writer had to recreate the database file; the
    /// indexer watches this to trigger a full re-scan.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Start the writer thread owning `conn`. `db_path` is empty for tests that
/// never exercise file recovery.
pub(crate) fn spawn_writer(conn: Connection, db_path: PathBuf) -> WriterHandle {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let generation = Arc::new(AtomicU64::new(0));
    let gen_clone = generation.clone();

    std::thread::Builder::new()
        .name("hindsight-store-writer".to_string())
        .spawn(move || writer_loop(conn, rx, db_path, gen_clone))
        .expect("failed to spawn store writer thread");

    WriterHandle { tx, generation }
}

fn writer_loop(
    mut conn: Connection,
    mut rx: mpsc::Receiver<WriteRequest>,
    db_path: PathBuf,
    generation: Arc<AtomicU64>,
) {
    while let Some(first) = rx.blocking_recv() {
        let mut batch = vec![first];
        let mut rows = batch[0].job.rows();
        while rows < MAX_BATCH_ROWS {
            match rx.try_recv() {
                Ok(req) => {
                    rows += req.job.rows();
                    batch.push(req);
                }
                Err(_) => break,
            }
        }

        // Database file removed out from under us: recreate and re-migrate,
        // then bump the generation so the indexer schedules a full re-scan.
        if !db_path.as_os_str().is_empty() && !db_path.exists() {
            error!(path = %db_path.display(), "database file disappeared, recreating");
            match reopen(&db_path) {
                Ok(fresh) => {
                    conn = fresh;
                    generation.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(error = %e, "failed to recreate database file");
                    for req in batch {
                        let _ = req.reply.send(Err(StoreError::Closed));
                    }
                    continue;
                }
            }
        }

        let results = execute_batch(&mut conn, &batch);
        for (req, result) in batch.into_iter().zip(results) {
            let _ = req.reply.send(result);
        }
    }
    info!("store writer shut down");
}

fn reopen(db_path: &std::path::Path) -> Result<Connection, StoreError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(db_path)?;
    crate::configure_connection(&conn)?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

enum BatchFailure {
    Busy,
    Permanent,
}

fn execute_batch(
    conn: &mut Connection,
    batch: &[WriteRequest],
) -> Vec<Result<WriteOutcome, StoreError>> {
    for attempt in 0..=MAX_RETRIES {
        match try_transaction(conn, batch) {
            Ok(outcomes) => return outcomes.into_iter().map(Ok).collect(),
            Err(BatchFailure::Busy) => {
                let backoff = BASE_BACKOFF_MS * (1 << attempt);
                warn!(attempt, backoff_ms = backoff, "write transaction busy, retrying");
                std::thread::sleep(std::time::Duration::from_millis(backoff));
            }
            Err(BatchFailure::Permanent) => return execute_individually(conn, batch),
        }
    }
    batch.iter().map(|_| Err(StoreError::Busy)).collect()
}

/// Apply the whole batch in one transaction. Any job error aborts the
/// transaction: busy errors ask for a retry, everything else falls back to
/// per-job execution so the culprit can be isolated.
fn try_transaction(
    conn: &mut Connection,
    batch: &[WriteRequest],
) -> Result<Vec<WriteOutcome>, BatchFailure> {
    let tx = conn.transaction().map_err(classify)?;
    let mut outcomes = Vec::with_capacity(batch.len());
    for req in batch {
        match apply_job(&tx, &req.job) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                let failure = classify(e);
                // tx drops here and rolls back
                return Err(failure);
            }
        }
    }
    tx.commit().map_err(classify)?;
    Ok(outcomes)
}

fn execute_individually(
    conn: &mut Connection,
    batch: &[WriteRequest],
) -> Vec<Result<WriteOutcome, StoreError>> {
    batch
        .iter()
        .map(|req| {
            for attempt in 0..=MAX_RETRIES {
                let result = conn
                    .transaction()
                    .and_then(|tx| {
                        let outcome = apply_job(&tx, &req.job)?;
                        tx.commit()?;
                        Ok(outcome)
                    });
                match result {
                    Ok(outcome) => return Ok(outcome),
                    Err(e) if is_busy(&e) && attempt < MAX_RETRIES => {
                        std::thread::sleep(std::time::Duration::from_millis(
                            BASE_BACKOFF_MS * (1 << attempt),
                        ));
                    }
                    Err(e) if is_busy(&e) => return Err(StoreError::Busy),
                    Err(e) => return Err(StoreError::Sqlite(e)),
                }
            }
            Err(StoreError::Busy)
        })
        .collect()
}

fn apply_job(conn: &Connection, job: &WriteJob) -> rusqlite::Result<WriteOutcome> {
    let now = chrono::Utc::now().timestamp();
    match job {
        WriteJob::IndexTranscript {
            conversation,
            messages,
        } => {
            queries::upsert_conversation(conn, conversation, now)?;
            queries::replace_messages(conn, &conversation.session_id, messages)?;
            Ok(WriteOutcome::Done)
        }
        WriteJob::RecordShadowCommit {
            commit,
            correlation,
        } => {
            queries::record_shadow_commit(conn, commit)?;
            if let Some(correlation) = correlation {
                queries::record_correlation(conn, correlation)?;
            }
            Ok(WriteOutcome::Done)
        }
        WriteJob::UpsertRepository(repo) => {
            queries::upsert_repository(conn, repo)?;
            Ok(WriteOutcome::Done)
        }
        WriteJob::PutRepoSettings(settings) => {
            queries::put_repo_settings(conn, settings)?;
            Ok(WriteOutcome::Done)
        }
        WriteJob::RemoveRepoSettings { root } => {
            let existed = queries::remove_repo_settings(conn, root)?;
            Ok(WriteOutcome::Existed(existed))
        }
        WriteJob::SetRepoEnabled { root, enabled } => {
            let existed = queries::set_repo_enabled(conn, root, *enabled)?;
            Ok(WriteOutcome::Existed(existed))
        }
        WriteJob::CreateRestorePoint {
            repo_root,
            label,
            commit_hash,
            description,
        } => {
            let id =
                queries::create_restore_point(conn, repo_root, label, commit_hash, description, now)?;
            Ok(WriteOutcome::Id(id))
        }
        WriteJob::PutIndexerState {
            source_path,
            file_size,
            modified_at,
        } => {
            queries::put_indexer_state(conn, source_path, *file_size, *modified_at, now)?;
            Ok(WriteOutcome::Done)
        }
        WriteJob::RemoveIndexerStates { source_paths } => {
            queries::remove_indexer_states(conn, source_paths)?;
            Ok(WriteOutcome::Done)
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::DatabaseBusy
                || info.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn classify(e: rusqlite::Error) -> BatchFailure {
    if is_busy(&e) {
        BatchFailure::Busy
    } else {
        BatchFailure::Permanent
    }
}
