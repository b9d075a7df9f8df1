// crates/db/src/lib.rs
//! The hindsight store: one SQLite file, one writer, many readers.
//!
//! The database engine is compiled in (`rusqlite` with `bundled`) rather
//! than dynamically linked from the OS, pinning a known-good SQLite. All
//! writes serialize through the single-writer actor in [`writer`]; reads go
//! through a small pool of query-only connections. On open the file is
//! integrity-checked, repaired in place when possible, and archived and
//! recreated when not — the indexer reconstructs the content.

pub mod indexer;
mod migrations;
pub mod queries;
pub mod search;
mod writer;

pub use queries::{
    parse_timeframe, ConversationSummary, CorrelationRecord, IndexerEntry, MessagePage,
    NotifyMode, RepoSettings, RepositoryRecord, RestorePointRow, SearchHit, SearchResults,
    ShadowCommitRecord, StoreStats,
};
pub use writer::{WriteJob, WriteOutcome};

use hindsight_core::{ConversationRecord, ErrorClass, MessageRecord};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use writer::WriterHandle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store writer is closed")]
    Closed,

    #[error("database busy after retries")]
    Busy,

    #[error("home directory not found")]
    NoHomeDir,

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed")]
    Join,

    #[error("{0} not found")]
    NotFound(&'static str),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Busy => ErrorClass::Transient,
            StoreError::NotFound(_) => ErrorClass::PermanentCaller,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(info, _))
                if info.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ErrorClass::PermanentCaller
            }
            StoreError::Sqlite(_) | StoreError::Io(_) => ErrorClass::PermanentStore,
            StoreError::Closed | StoreError::Join => ErrorClass::FatalProcess,
            StoreError::NoHomeDir => ErrorClass::FatalProcess,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the open-time integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityState {
    /// `PRAGMA integrity_check` came back clean.
    Ok,
    /// Corruption detected and fixed by an index rebuild.
    Repaired,
    /// The file was archived and recreated empty.
    Rebuilt,
}

impl IntegrityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityState::Ok => "ok",
            IntegrityState::Repaired => "repaired",
            IntegrityState::Rebuilt => "rebuilt",
        }
    }
}

/// Shared pragmas for every connection, write or read.
pub(crate) fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

const READ_POOL_SIZE: usize = 4;

/// A small pool of query-only read connections.
#[derive(Clone)]
struct ReadPool {
    inner: Arc<ReadPoolInner>,
}

struct ReadPoolInner {
    path: PathBuf,
    conns: tokio::sync::Mutex<Vec<Connection>>,
    permits: tokio::sync::Semaphore,
}

impl ReadPool {
    fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(ReadPoolInner {
                path,
                conns: tokio::sync::Mutex::new(Vec::new()),
                permits: tokio::sync::Semaphore::new(READ_POOL_SIZE),
            }),
        }
    }

    /// Run a read closure on a pooled connection inside `spawn_blocking`.
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Closed)?;

        let conn = {
            let mut pool = self.inner.conns.lock().await;
            pool.pop()
        };
        let path = self.inner.path.clone();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let conn = match conn {
                Some(c) => c,
                None => match open_read_connection(&path) {
                    Ok(c) => c,
                    Err(e) => return (None, Err(e)),
                },
            };
            let result = f(&conn).map_err(StoreError::Sqlite);
            (Some(conn), result)
        })
        .await
        .map_err(|_| StoreError::Join)?;

        if let Some(conn) = conn {
            self.inner.conns.lock().await.push(conn);
        }
        result
    }
}

fn open_read_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    configure_connection(&conn)?;
    // Readers must never write; enforce it at the connection.
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(conn)
}

/// Handle to the store. Cheap to clone; all clones share the writer actor
/// and the read pool.
#[derive(Clone)]
pub struct Store {
    writer: WriterHandle,
    readers: ReadPool,
    path: PathBuf,
    integrity: IntegrityState,
}

impl Store {
    /// Open or create the store at `path`, verifying integrity and applying
    /// migrations before the writer starts accepting jobs.
    pub async fn open(path: &Path) -> StoreResult<Store> {
        let path = path.to_path_buf();
        let open_path = path.clone();
        let (conn, integrity) =
            tokio::task::spawn_blocking(move || open_and_verify(&open_path))
                .await
                .map_err(|_| StoreError::Join)??;

        info!(path = %path.display(), integrity = integrity.as_str(), "store opened");

        let writer = writer::spawn_writer(conn, path.clone());
        let readers = ReadPool::new(path.clone());

        Ok(Store {
            writer,
            readers,
            path,
            integrity,
        })
    }

    /// Open the store at the canonical path under the home directory.
    pub async fn open_default() -> StoreResult<Store> {
        let path = hindsight_core::paths::db_path().ok_or(StoreError::NoHomeDir)?;
        Self::open(&path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What the open-time integrity check found.
    pub fn integrity(&self) -> IntegrityState {
        self.integrity
    }

    /// Bumped when the writer recreated a vanished database file; watchers
    /// re-scan when this changes.
    pub fn generation(&self) -> u64 {
        self.writer.generation()
    }

    // ------------------------------------------------------------------
    // Write surface (serialized through the writer actor)
    // ------------------------------------------------------------------

    /// Upsert a conversation and replace its message set in one transaction.
    pub async fn index_transcript(
        &self,
        conversation: ConversationRecord,
        messages: Vec<MessageRecord>,
    ) -> StoreResult<()> {
        self.writer
            .submit(WriteJob::IndexTranscript {
                conversation,
                messages,
            })
            .await
            .map(|_| ())
    }

    pub async fn record_shadow_commit(
        &self,
        commit: ShadowCommitRecord,
        correlation: Option<CorrelationRecord>,
    ) -> StoreResult<()> {
        self.writer
            .submit(WriteJob::RecordShadowCommit {
                commit,
                correlation,
            })
            .await
            .map(|_| ())
    }

    pub async fn upsert_repository(&self, repo: RepositoryRecord) -> StoreResult<()> {
        self.writer
            .submit(WriteJob::UpsertRepository(repo))
            .await
            .map(|_| ())
    }

    pub async fn put_repo_settings(&self, settings: RepoSettings) -> StoreResult<()> {
        self.writer
            .submit(WriteJob::PutRepoSettings(settings))
            .await
            .map(|_| ())
    }

    /// Remove a repository's settings; `Ok(false)` when no row existed.
    pub async fn remove_repo_settings(&self, root: &str) -> StoreResult<bool> {
        match self
            .writer
            .submit(WriteJob::RemoveRepoSettings {
                root: root.to_string(),
            })
            .await?
        {
            WriteOutcome::Existed(existed) => Ok(existed),
            _ => Ok(false),
        }
    }

    pub async fn set_repo_enabled(&self, root: &str, enabled: bool) -> StoreResult<bool> {
        match self
            .writer
            .submit(WriteJob::SetRepoEnabled {
                root: root.to_string(),
                enabled,
            })
            .await?
        {
            WriteOutcome::Existed(existed) => Ok(existed),
            _ => Ok(false),
        }
    }

    /// Create a restore point; returns its row id.
    pub async fn create_restore_point(
        &self,
        repo_root: &str,
        label: &str,
        commit_hash: &str,
        description: &str,
    ) -> StoreResult<i64> {
        match self
            .writer
            .submit(WriteJob::CreateRestorePoint {
                repo_root: repo_root.to_string(),
                label: label.to_string(),
                commit_hash: commit_hash.to_string(),
                description: description.to_string(),
            })
            .await?
        {
            WriteOutcome::Id(id) => Ok(id),
            _ => Err(StoreError::NotFound("restore point id")),
        }
    }

    pub async fn put_indexer_state(
        &self,
        source_path: &str,
        file_size: i64,
        modified_at: i64,
    ) -> StoreResult<()> {
        self.writer
            .submit(WriteJob::PutIndexerState {
                source_path: source_path.to_string(),
                file_size,
                modified_at,
            })
            .await
            .map(|_| ())
    }

    pub async fn remove_indexer_states(&self, source_paths: Vec<String>) -> StoreResult<()> {
        self.writer
            .submit(WriteJob::RemoveIndexerStates { source_paths })
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Read surface (pooled query-only connections)
    // ------------------------------------------------------------------

    pub async fn search(&self, query: &str, limit: i64) -> StoreResult<SearchResults> {
        self.search_with_timeframe(query, limit, None).await
    }

    /// Search restricted to conversations updated within `timeframe`
    /// (shapes like "24h", "7d"; unknown shapes mean no cutoff).
    pub async fn search_with_timeframe(
        &self,
        query: &str,
        limit: i64,
        timeframe: Option<&str>,
    ) -> StoreResult<SearchResults> {
        let query = query.to_string();
        let cutoff = timeframe
            .and_then(parse_timeframe)
            .map(|window| chrono::Utc::now().timestamp() - window);
        self.readers
            .run(move |conn| queries::search(conn, &query, limit, cutoff))
            .await
    }

    pub async fn find_similar(&self, query: &str, limit: i64) -> StoreResult<Vec<SearchHit>> {
        let query = query.to_string();
        self.readers
            .run(move |conn| queries::find_similar(conn, &query, limit))
            .await
    }

    /// List conversations by recency. `timeframe` accepts shapes like
    /// "24h", "7d", "today"; unknown shapes mean no cutoff.
    pub async fn list_recent(
        &self,
        limit: i64,
        timeframe: Option<&str>,
    ) -> StoreResult<Vec<ConversationSummary>> {
        let cutoff = timeframe
            .and_then(parse_timeframe)
            .map(|window| chrono::Utc::now().timestamp() - window);
        self.readers
            .run(move |conn| queries::list_recent(conn, limit, cutoff))
            .await
    }

    pub async fn conversation(&self, session_id: &str) -> StoreResult<Option<ConversationSummary>> {
        let session_id = session_id.to_string();
        self.readers
            .run(move |conn| queries::get_conversation(conn, &session_id))
            .await
    }

    pub async fn conversation_messages(
        &self,
        session_id: &str,
        page: i64,
        page_size: i64,
    ) -> StoreResult<MessagePage> {
        let session_id = session_id.to_string();
        self.readers
            .run(move |conn| queries::conversation_messages(conn, &session_id, page, page_size))
            .await
    }

    pub async fn repository(&self, root: &str) -> StoreResult<Option<RepositoryRecord>> {
        let root = root.to_string();
        self.readers
            .run(move |conn| queries::get_repository(conn, &root))
            .await
    }

    pub async fn repo_settings(&self, root: &str) -> StoreResult<Option<RepoSettings>> {
        let root = root.to_string();
        self.readers
            .run(move |conn| queries::get_repo_settings(conn, &root))
            .await
    }

    pub async fn list_repo_settings(&self) -> StoreResult<Vec<RepoSettings>> {
        self.readers.run(queries::list_repo_settings).await
    }

    pub async fn restore_points(
        &self,
        repo_root: &str,
        limit: i64,
    ) -> StoreResult<Vec<RestorePointRow>> {
        let repo_root = repo_root.to_string();
        self.readers
            .run(move |conn| queries::list_restore_points(conn, &repo_root, limit))
            .await
    }

    pub async fn restore_point(
        &self,
        repo_root: &str,
        id: i64,
    ) -> StoreResult<Option<RestorePointRow>> {
        let repo_root = repo_root.to_string();
        self.readers
            .run(move |conn| queries::get_restore_point(conn, &repo_root, id))
            .await
    }

    pub async fn shadow_commits_for_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<ShadowCommitRecord>> {
        let session_id = session_id.to_string();
        self.readers
            .run(move |conn| queries::shadow_commits_for_session(conn, &session_id, limit))
            .await
    }

    pub async fn session_for_commit(
        &self,
        commit_hash: &str,
    ) -> StoreResult<Option<CorrelationRecord>> {
        let commit_hash = commit_hash.to_string();
        self.readers
            .run(move |conn| queries::session_for_commit(conn, &commit_hash))
            .await
    }

    pub async fn indexer_states(&self) -> StoreResult<HashMap<String, IndexerEntry>> {
        self.readers.run(queries::all_indexer_states).await
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        self.readers.run(queries::stats).await
    }

    /// Size of the database file on disk, in bytes.
    pub fn db_size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Open the database, verify integrity, repair or recreate as needed, and
/// apply migrations. Runs on a blocking thread.
fn open_and_verify(path: &Path) -> StoreResult<(Connection, IntegrityState)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut conn = Connection::open(path)?;
    configure_connection(&conn)?;

    let mut integrity = IntegrityState::Ok;
    if !integrity_ok(&conn) {
        warn!(path = %path.display(), "integrity check failed, attempting index rebuild");
        let _ = conn.execute_batch("REINDEX;");
        if integrity_ok(&conn) {
            integrity = IntegrityState::Repaired;
        } else {
            drop(conn);
            archive_corrupt_db(path)?;
            conn = Connection::open(path)?;
            configure_connection(&conn)?;
            integrity = IntegrityState::Rebuilt;
        }
    }

    if let Err(e) = migrations::apply_migrations(&mut conn) {
        // A migration that cannot apply means the file predates repair or
        // carries foreign schema; archive and start over once.
        warn!(error = %e, "migrations failed, archiving database and recreating");
        drop(conn);
        archive_corrupt_db(path)?;
        conn = Connection::open(path)?;
        configure_connection(&conn)?;
        migrations::apply_migrations(&mut conn)?;
        integrity = IntegrityState::Rebuilt;
    }

    Ok((conn, integrity))
}

fn integrity_ok(conn: &Connection) -> bool {
    conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
        .map(|result| result == "ok")
        .unwrap_or(false)
}

/// Move a corrupt database (and its WAL sidecars) out of the way.
fn archive_corrupt_db(path: &Path) -> std::io::Result<()> {
    let stamp = chrono::Utc::now().timestamp();
    let archived = path.with_extension(format!("db.corrupt.{stamp}"));
    match std::fs::rename(path, &archived) {
        Ok(()) => warn!(archived = %archived.display(), "archived corrupt database"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
    Ok(())
}
