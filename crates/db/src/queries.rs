// crates/db/src/queries.rs
// Row types and SQL for the hindsight store. Every function here takes a
// plain `&Connection`; the writer actor and the read pool decide which
// connection that is.

use chrono::{DateTime, SecondsFormat, Utc};
use hindsight_core::{ContentKind, ConversationRecord, MessageRecord, Role};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::search::{build_match_expr, clamp_snippet};

// ============================================================================
// Row types
// ============================================================================

/// One conversation-level search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub session_id: String,
    pub project_name: String,
    pub message_count: i64,
    /// Best-match snippet with `[` `]` highlight markers, ≤ 200 chars.
    pub preview: String,
    /// BM25 rank — lower is better.
    #[serde(skip)]
    pub rank: f64,
}

/// Search results plus the total number of matching conversations.
#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub total_found: i64,
}

/// Conversation listing row (no message content).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub session_id: String,
    pub project_name: String,
    pub project_path: String,
    pub title: String,
    pub last_updated: String,
    pub message_count: i64,
    pub token_count: i64,
}

/// One page of a conversation, by ordinal-index range.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub session_id: String,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    pub total_messages: i64,
    pub messages: Vec<MessageRecord>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub conversations: i64,
    pub messages: i64,
    pub shadow_commits: i64,
    pub restore_points: i64,
}

/// A discovered repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub root: String,
    pub remote_url: Option<String>,
    pub default_branch: Option<String>,
    pub is_monorepo_subdirectory: bool,
    pub subdirectory: Option<String>,
}

/// A shadow commit as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowCommitRecord {
    /// Full 40-hex commit hash.
    pub commit_hash: String,
    pub shadow_branch: String,
    pub original_branch: String,
    pub repo_root: String,
    pub files: Vec<String>,
    pub message: String,
    pub session_id: Option<String>,
    pub confidence: f64,
    pub created_at: i64,
}

/// A conversation↔commit correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRecord {
    pub session_id: String,
    pub commit_hash: String,
    pub repo_root: String,
    pub confidence: f64,
    pub created_at: i64,
}

/// Notification preference for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyMode {
    Disabled,
    EveryCommit,
    Batched,
    Hourly,
}

impl NotifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyMode::Disabled => "disabled",
            NotifyMode::EveryCommit => "every-commit",
            NotifyMode::Batched => "batched",
            NotifyMode::Hourly => "hourly",
        }
    }

    pub fn parse(s: &str) -> Option<NotifyMode> {
        match s {
            "disabled" => Some(NotifyMode::Disabled),
            "every-commit" => Some(NotifyMode::EveryCommit),
            "batched" => Some(NotifyMode::Batched),
            "hourly" => Some(NotifyMode::Hourly),
            _ => None,
        }
    }
}

/// Per-repository shadow-commit settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoSettings {
    pub root: String,
    pub enabled: bool,
    pub notify_mode: NotifyMode,
    /// Per-repository exclusion globs, added on top of the built-in set.
    pub excludes: Vec<String>,
    pub throttle_secs: i64,
    pub max_file_mb: i64,
    pub branch_prefix: String,
}

impl RepoSettings {
    pub fn defaults_for(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            enabled: true,
            notify_mode: NotifyMode::Batched,
            excludes: Vec::new(),
            throttle_secs: 2,
            max_file_mb: 10,
            branch_prefix: "shadow/".to_string(),
        }
    }
}

/// A stored restore point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePointRow {
    pub id: i64,
    pub repo_root: String,
    pub label: String,
    pub commit_hash: String,
    pub description: String,
    pub created_at: i64,
}

/// Indexer progress entry for one transcript file.
#[derive(Debug, Clone)]
pub struct IndexerEntry {
    pub source_path: String,
    pub file_size: i64,
    pub modified_at: i64,
    pub indexed_at: i64,
}

// ============================================================================
// Binding discipline
// ============================================================================

/// Booleans cross the binding layer as 0/1 integers, nothing else.
pub(crate) fn bool_to_int(b: bool) -> i64 {
    if b {
        1
    } else {
        0
    }
}

/// Strict read-side conversion — any stored value other than 0/1 is a defect.
pub(crate) fn int_to_bool(v: i64) -> rusqlite::Result<bool> {
    match v {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(rusqlite::Error::IntegralValueOutOfRange(0, other)),
    }
}

pub(crate) fn unix_to_iso(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

pub(crate) fn iso_to_unix(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

/// Parse a timeframe suffix string ("30m", "24h", "7d", "2w", "today") into
/// a cutoff duration in seconds. Unknown shapes mean "no cutoff".
pub fn parse_timeframe(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("today") {
        return Some(24 * 3600);
    }
    let (digits, unit) = s.split_at(s.len().checked_sub(1)?);
    let n: i64 = digits.parse().ok()?;
    match unit {
        "m" => Some(n * 60),
        "h" => Some(n * 3600),
        "d" => Some(n * 86_400),
        "w" => Some(n * 7 * 86_400),
        _ => None,
    }
}

// ============================================================================
// Conversations + messages (write path)
// ============================================================================

/// Insert or update a conversation by session identifier.
///
/// `first_seen_at` is preserved across updates; everything else follows the
/// latest parse of the source file.
pub fn upsert_conversation(
    conn: &Connection,
    rec: &ConversationRecord,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO conversations
            (session_id, project_name, project_path, title,
             first_seen_at, last_updated_at, message_count, token_count, source_path)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8)
        ON CONFLICT(session_id) DO UPDATE SET
            project_name    = excluded.project_name,
            project_path    = excluded.project_path,
            title           = excluded.title,
            last_updated_at = excluded.last_updated_at,
            message_count   = excluded.message_count,
            token_count     = excluded.token_count,
            source_path     = excluded.source_path
        "#,
        params![
            rec.session_id,
            rec.project_name,
            rec.project_path,
            rec.title,
            now,
            rec.message_count,
            rec.token_count,
            rec.source_path,
        ],
    )?;
    Ok(())
}

/// Replace the full message set of a conversation.
///
/// The FTS index follows through the insert/delete triggers.
pub fn replace_messages(
    conn: &Connection,
    session_id: &str,
    messages: &[MessageRecord],
) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM messages WHERE session_id = ?1",
        params![session_id],
    )?;

    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO messages (session_id, idx, source_uuid, role, content, content_kind, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )?;
    for msg in messages {
        let created_at = msg.timestamp.as_deref().and_then(iso_to_unix);
        stmt.execute(params![
            session_id,
            msg.idx,
            msg.source_uuid,
            msg.role.as_str(),
            msg.content,
            msg.kind.as_str(),
            created_at,
        ])?;
    }
    Ok(())
}

// ============================================================================
// Conversations + messages (read path)
// ============================================================================

pub fn get_conversation(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Option<ConversationSummary>> {
    conn.query_row(
        r#"
        SELECT session_id, project_name, project_path, title,
               last_updated_at, message_count, token_count
        FROM conversations WHERE session_id = ?1
        "#,
        params![session_id],
        summary_from_row,
    )
    .optional()
}

pub fn list_recent(
    conn: &Connection,
    limit: i64,
    cutoff: Option<i64>,
) -> rusqlite::Result<Vec<ConversationSummary>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT session_id, project_name, project_path, title,
               last_updated_at, message_count, token_count
        FROM conversations
        WHERE last_updated_at >= ?1
        ORDER BY last_updated_at DESC
        LIMIT ?2
        "#,
    )?;
    let rows = stmt.query_map(params![cutoff.unwrap_or(0), limit], summary_from_row)?;
    rows.collect()
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        session_id: row.get(0)?,
        project_name: row.get(1)?,
        project_path: row.get(2)?,
        title: row.get(3)?,
        last_updated: unix_to_iso(row.get(4)?),
        message_count: row.get(5)?,
        token_count: row.get(6)?,
    })
}

/// Page through a conversation by ordinal-index range.
///
/// `page` is 1-based; `page_size` is clamped to 1..=500.
pub fn conversation_messages(
    conn: &Connection,
    session_id: &str,
    page: i64,
    page_size: i64,
) -> rusqlite::Result<MessagePage> {
    let page_size = page_size.clamp(1, 500);
    let page = page.max(1);

    let total_messages: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
        params![session_id],
        |r| r.get(0),
    )?;
    let total_pages = (total_messages + page_size - 1) / page_size;

    let offset = (page - 1) * page_size;
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT idx, source_uuid, role, content, content_kind, created_at
        FROM messages
        WHERE session_id = ?1 AND idx >= ?2 AND idx < ?3
        ORDER BY idx
        "#,
    )?;
    let messages = stmt
        .query_map(params![session_id, offset, offset + page_size], |row| {
            let role: String = row.get(2)?;
            let kind: String = row.get(4)?;
            Ok(MessageRecord {
                idx: row.get(0)?,
                source_uuid: row.get(1)?,
                role: Role::parse(&role).unwrap_or(Role::System),
                content: row.get(3)?,
                kind: ContentKind::parse(&kind).unwrap_or(ContentKind::Text),
                timestamp: row.get::<_, Option<i64>>(5)?.map(unix_to_iso),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(MessagePage {
        session_id: session_id.to_string(),
        page,
        page_size,
        total_pages,
        total_messages,
        messages,
    })
}

// ============================================================================
// Full-text search
// ============================================================================

/// Conversation-level full-text search: best hit per conversation, BM25
/// order, recency tiebreak. `cutoff` (unix seconds) restricts hits to
/// conversations updated since then.
pub fn search(
    conn: &Connection,
    query: &str,
    limit: i64,
    cutoff: Option<i64>,
) -> rusqlite::Result<SearchResults> {
    let Some(expr) = build_match_expr(query) else {
        return Ok(SearchResults {
            hits: Vec::new(),
            total_found: 0,
        });
    };
    let cutoff = cutoff.unwrap_or(0);

    let total_found: i64 = conn.query_row(
        r#"
        SELECT COUNT(DISTINCT m.session_id)
        FROM messages_fts f
        JOIN messages m      ON m.rowid = f.rowid
        JOIN conversations c ON c.session_id = m.session_id
        WHERE messages_fts MATCH ?1 AND c.last_updated_at >= ?2
        "#,
        params![expr, cutoff],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        r#"
        SELECT session_id, project_name, message_count, preview, rank FROM (
            SELECT m.session_id            AS session_id,
                   c.project_name          AS project_name,
                   c.message_count         AS message_count,
                   snippet(messages_fts, 0, '[', ']', '...', 16) AS preview,
                   bm25(messages_fts)      AS rank,
                   c.last_updated_at       AS last_updated_at,
                   ROW_NUMBER() OVER (
                       PARTITION BY m.session_id ORDER BY bm25(messages_fts)
                   ) AS rn
            FROM messages_fts f
            JOIN messages m      ON m.rowid = f.rowid
            JOIN conversations c ON c.session_id = m.session_id
            WHERE messages_fts MATCH ?1 AND c.last_updated_at >= ?2
        )
        WHERE rn = 1
        ORDER BY rank, last_updated_at DESC
        LIMIT ?3
        "#,
    )?;
    let hits = stmt
        .query_map(params![expr, cutoff, limit], hit_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(SearchResults { hits, total_found })
}

/// Cross-project variant: the single best conversation per project.
pub fn find_similar(conn: &Connection, query: &str, limit: i64) -> rusqlite::Result<Vec<SearchHit>> {
    let Some(expr) = build_match_expr(query) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare_cached(
        r#"
        SELECT session_id, project_name, message_count, preview, rank FROM (
            SELECT m.session_id            AS session_id,
                   c.project_name          AS project_name,
                   c.message_count         AS message_count,
                   snippet(messages_fts, 0, '[', ']', '...', 16) AS preview,
                   bm25(messages_fts)      AS rank,
                   c.last_updated_at       AS last_updated_at,
                   ROW_NUMBER() OVER (
                       PARTITION BY c.project_name ORDER BY bm25(messages_fts)
                   ) AS rn
            FROM messages_fts f
            JOIN messages m      ON m.rowid = f.rowid
            JOIN conversations c ON c.session_id = m.session_id
            WHERE messages_fts MATCH ?1
        )
        WHERE rn = 1
        ORDER BY rank, last_updated_at DESC
        LIMIT ?2
        "#,
    )?;
    let result = stmt.query_map(params![expr, limit], hit_from_row)?
        .collect();
    result
}

fn hit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchHit> {
    let preview: String = row.get(3)?;
    Ok(SearchHit {
        session_id: row.get(0)?,
        project_name: row.get(1)?,
        message_count: row.get(2)?,
        preview: clamp_snippet(&preview),
        rank: row.get(4)?,
    })
}

// ============================================================================
// Repositories, shadow commits, correlations
// ============================================================================

pub fn upsert_repository(conn: &Connection, repo: &RepositoryRecord) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO repositories (root, remote_url, default_branch, is_monorepo_subdirectory, subdirectory)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(root) DO UPDATE SET
            remote_url               = excluded.remote_url,
            default_branch           = excluded.default_branch,
            is_monorepo_subdirectory = excluded.is_monorepo_subdirectory,
            subdirectory             = excluded.subdirectory
        "#,
        params![
            repo.root,
            repo.remote_url,
            repo.default_branch,
            bool_to_int(repo.is_monorepo_subdirectory),
            repo.subdirectory,
        ],
    )?;
    Ok(())
}

pub fn get_repository(conn: &Connection, root: &str) -> rusqlite::Result<Option<RepositoryRecord>> {
    conn.query_row(
        "SELECT root, remote_url, default_branch, is_monorepo_subdirectory, subdirectory
         FROM repositories WHERE root = ?1",
        params![root],
        |row| {
            Ok(RepositoryRecord {
                root: row.get(0)?,
                remote_url: row.get(1)?,
                default_branch: row.get(2)?,
                is_monorepo_subdirectory: int_to_bool(row.get(3)?)?,
                subdirectory: row.get(4)?,
            })
        },
    )
    .optional()
}

pub fn record_shadow_commit(conn: &Connection, rec: &ShadowCommitRecord) -> rusqlite::Result<()> {
    let files_json = serde_json::to_string(&rec.files).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        r#"
        INSERT OR REPLACE INTO shadow_commits
            (commit_hash, shadow_branch, original_branch, repo_root,
             files_json, message, session_id, confidence, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            rec.commit_hash,
            rec.shadow_branch,
            rec.original_branch,
            rec.repo_root,
            files_json,
            rec.message,
            rec.session_id,
            rec.confidence,
            rec.created_at,
        ],
    )?;
    Ok(())
}

pub fn record_correlation(conn: &Connection, rec: &CorrelationRecord) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO correlations (session_id, commit_hash, repo_root, confidence, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            rec.session_id,
            rec.commit_hash,
            rec.repo_root,
            rec.confidence,
            rec.created_at,
        ],
    )?;
    Ok(())
}

pub fn shadow_commits_for_session(
    conn: &Connection,
    session_id: &str,
    limit: i64,
) -> rusqlite::Result<Vec<ShadowCommitRecord>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT commit_hash, shadow_branch, original_branch, repo_root,
               files_json, message, session_id, confidence, created_at
        FROM shadow_commits
        WHERE session_id = ?1
        ORDER BY created_at DESC
        LIMIT ?2
        "#,
    )?;
    let result = stmt.query_map(params![session_id, limit], shadow_commit_from_row)?
        .collect();
    result
}

pub fn session_for_commit(conn: &Connection, commit_hash: &str) -> rusqlite::Result<Option<CorrelationRecord>> {
    conn.query_row(
        r#"
        SELECT session_id, commit_hash, repo_root, confidence, created_at
        FROM correlations WHERE commit_hash = ?1
        ORDER BY confidence DESC LIMIT 1
        "#,
        params![commit_hash],
        |row| {
            Ok(CorrelationRecord {
                session_id: row.get(0)?,
                commit_hash: row.get(1)?,
                repo_root: row.get(2)?,
                confidence: row.get(3)?,
                created_at: row.get(4)?,
            })
        },
    )
    .optional()
}

fn shadow_commit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShadowCommitRecord> {
    let files_json: String = row.get(4)?;
    Ok(ShadowCommitRecord {
        commit_hash: row.get(0)?,
        shadow_branch: row.get(1)?,
        original_branch: row.get(2)?,
        repo_root: row.get(3)?,
        files: serde_json::from_str(&files_json).unwrap_or_default(),
        message: row.get(5)?,
        session_id: row.get(6)?,
        confidence: row.get(7)?,
        created_at: row.get(8)?,
    })
}

// ============================================================================
// Repository settings
// ============================================================================

pub fn put_repo_settings(conn: &Connection, settings: &RepoSettings) -> rusqlite::Result<()> {
    let excludes_json = serde_json::to_string(&settings.excludes).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        r#"
        INSERT INTO repo_settings (root, enabled, notify_mode, excludes_json, throttle_secs, max_file_mb, branch_prefix)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(root) DO UPDATE SET
            enabled       = excluded.enabled,
            notify_mode   = excluded.notify_mode,
            excludes_json = excluded.excludes_json,
            throttle_secs = excluded.throttle_secs,
            max_file_mb   = excluded.max_file_mb,
            branch_prefix = excluded.branch_prefix
        "#,
        params![
            settings.root,
            bool_to_int(settings.enabled),
            settings.notify_mode.as_str(),
            excludes_json,
            settings.throttle_secs,
            settings.max_file_mb,
            settings.branch_prefix,
        ],
    )?;
    Ok(())
}

pub fn get_repo_settings(conn: &Connection, root: &str) -> rusqlite::Result<Option<RepoSettings>> {
    conn.query_row(
        "SELECT root, enabled, notify_mode, excludes_json, throttle_secs, max_file_mb, branch_prefix
         FROM repo_settings WHERE root = ?1",
        params![root],
        repo_settings_from_row,
    )
    .optional()
}

pub fn list_repo_settings(conn: &Connection) -> rusqlite::Result<Vec<RepoSettings>> {
    let mut stmt = conn.prepare_cached(
        "SELECT root, enabled, notify_mode, excludes_json, throttle_secs, max_file_mb, branch_prefix
         FROM repo_settings ORDER BY root",
    )?;
    let result = stmt.query_map([], repo_settings_from_row)?.collect();
    result
}

pub fn remove_repo_settings(conn: &Connection, root: &str) -> rusqlite::Result<bool> {
    let n = conn.execute("DELETE FROM repo_settings WHERE root = ?1", params![root])?;
    Ok(n > 0)
}

pub fn set_repo_enabled(conn: &Connection, root: &str, enabled: bool) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE repo_settings SET enabled = ?2 WHERE root = ?1",
        params![root, bool_to_int(enabled)],
    )?;
    Ok(n > 0)
}

fn repo_settings_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoSettings> {
    let notify: String = row.get(2)?;
    let excludes_json: String = row.get(3)?;
    Ok(RepoSettings {
        root: row.get(0)?,
        enabled: int_to_bool(row.get(1)?)?,
        notify_mode: NotifyMode::parse(&notify).unwrap_or(NotifyMode::Batched),
        excludes: serde_json::from_str(&excludes_json).unwrap_or_default(),
        throttle_secs: row.get(4)?,
        max_file_mb: row.get(5)?,
        branch_prefix: row.get(6)?,
    })
}

// ============================================================================
// Restore points
// ============================================================================

pub fn create_restore_point(
    conn: &Connection,
    repo_root: &str,
    label: &str,
    commit_hash: &str,
    description: &str,
    now: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        r#"
        INSERT INTO restore_points (repo_root, label, commit_hash, description, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![repo_root, label, commit_hash, description, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_restore_points(
    conn: &Connection,
    repo_root: &str,
    limit: i64,
) -> rusqlite::Result<Vec<RestorePointRow>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT id, repo_root, label, commit_hash, description, created_at
        FROM restore_points
        WHERE repo_root = ?1
        ORDER BY created_at DESC, id DESC
        LIMIT ?2
        "#,
    )?;
    let result = stmt.query_map(params![repo_root, limit], restore_point_from_row)?
        .collect();
    result
}

pub fn get_restore_point(
    conn: &Connection,
    repo_root: &str,
    id: i64,
) -> rusqlite::Result<Option<RestorePointRow>> {
    conn.query_row(
        "SELECT id, repo_root, label, commit_hash, description, created_at
         FROM restore_points WHERE repo_root = ?1 AND id = ?2",
        params![repo_root, id],
        restore_point_from_row,
    )
    .optional()
}

fn restore_point_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RestorePointRow> {
    Ok(RestorePointRow {
        id: row.get(0)?,
        repo_root: row.get(1)?,
        label: row.get(2)?,
        commit_hash: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ============================================================================
// Indexer state
// ============================================================================

pub fn all_indexer_states(conn: &Connection) -> rusqlite::Result<HashMap<String, IndexerEntry>> {
    let mut stmt =
        conn.prepare_cached("SELECT source_path, file_size, modified_at, indexed_at FROM indexer_state")?;
    let rows = stmt.query_map([], |row| {
        Ok(IndexerEntry {
            source_path: row.get(0)?,
            file_size: row.get(1)?,
            modified_at: row.get(2)?,
            indexed_at: row.get(3)?,
        })
    })?;
    let mut map = HashMap::new();
    for entry in rows {
        let entry = entry?;
        map.insert(entry.source_path.clone(), entry);
    }
    Ok(map)
}

pub fn put_indexer_state(
    conn: &Connection,
    source_path: &str,
    file_size: i64,
    modified_at: i64,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO indexer_state (source_path, file_size, modified_at, indexed_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(source_path) DO UPDATE SET
            file_size   = excluded.file_size,
            modified_at = excluded.modified_at,
            indexed_at  = excluded.indexed_at
        "#,
        params![source_path, file_size, modified_at, now],
    )?;
    Ok(())
}

pub fn remove_indexer_states(conn: &Connection, source_paths: &[String]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM indexer_state WHERE source_path = ?1")?;
    for path in source_paths {
        stmt.execute(params![path])?;
    }
    Ok(())
}

// ============================================================================
// Stats
// ============================================================================

pub fn stats(conn: &Connection) -> rusqlite::Result<StoreStats> {
    let conversations: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?;
    let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
    let shadow_commits: i64 =
        conn.query_row("SELECT COUNT(*) FROM shadow_commits", [], |r| r.get(0))?;
    let restore_points: i64 =
        conn.query_row("SELECT COUNT(*) FROM restore_points", [], |r| r.get(0))?;
    Ok(StoreStats {
        conversations,
        messages,
        shadow_commits,
        restore_points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::apply_migrations;
    use pretty_assertions::assert_eq;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn
    }

    fn conversation(session_id: &str) -> ConversationRecord {
        ConversationRecord {
            session_id: session_id.to_string(),
            project_name: "ketchup".to_string(),
            project_path: "/home/me/ketchup".to_string(),
            title: "tell me about ketchup".to_string(),
            message_count: 2,
            token_count: 12,
            source_path: "/t/s.jsonl".to_string(),
        }
    }

    fn message(idx: i64, role: Role, content: &str) -> MessageRecord {
        MessageRecord {
            idx,
            role,
            content: content.to_string(),
            kind: ContentKind::Text,
            source_uuid: None,
            timestamp: Some("2026-07-01T09:00:00Z".to_string()),
        }
    }

    #[test]
    fn upsert_preserves_first_seen() {
        let conn = test_conn();
        upsert_conversation(&conn, &conversation("s1"), 100).unwrap();
        upsert_conversation(&conn, &conversation("s1"), 200).unwrap();

        let (first, last): (i64, i64) = conn
            .query_row(
                "SELECT first_seen_at, last_updated_at FROM conversations WHERE session_id='s1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(first, 100);
        assert_eq!(last, 200);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn replace_messages_is_idempotent() {
        let conn = test_conn();
        upsert_conversation(&conn, &conversation("s1"), 100).unwrap();
        let msgs = vec![
            message(0, Role::User, "tell me about ketchup"),
            message(1, Role::Assistant, "a condiment"),
        ];
        replace_messages(&conn, "s1", &msgs).unwrap();
        replace_messages(&conn, "s1", &msgs).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages WHERE session_id='s1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn search_finds_conversation_level_hits() {
        let conn = test_conn();
        upsert_conversation(&conn, &conversation("s1"), 100).unwrap();
        replace_messages(
            &conn,
            "s1",
            &[
                message(0, Role::User, "tell me about ketchup"),
                message(1, Role::Assistant, "ketchup is a tomato condiment"),
            ],
        )
        .unwrap();

        let results = search(&conn, "project ketchup", 5, None).unwrap();
        assert_eq!(results.total_found, 1);
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].session_id, "s1");
        assert!(results.hits[0].preview.contains("ketchup"));
    }

    #[test]
    fn search_empty_query_is_empty_result() {
        let conn = test_conn();
        let results = search(&conn, "   ", 5, None).unwrap();
        assert_eq!(results.total_found, 0);
        assert!(results.hits.is_empty());
    }

    #[test]
    fn search_stems_terms() {
        let conn = test_conn();
        upsert_conversation(&conn, &conversation("s1"), 100).unwrap();
        replace_messages(&conn, "s1", &[message(0, Role::User, "indexing conversations")]).unwrap();

        // porter stemming: "indexed" matches "indexing"
        let results = search(&conn, "indexed", 5, None).unwrap();
        assert_eq!(results.total_found, 1);
    }

    #[test]
    fn find_similar_dedupes_by_project() {
        let conn = test_conn();
        let mut a = conversation("s1");
        a.project_name = "alpha".to_string();
        let mut b = conversation("s2");
        b.project_name = "alpha".to_string();
        let mut c = conversation("s3");
        c.project_name = "beta".to_string();
        for rec in [&a, &b, &c] {
            upsert_conversation(&conn, rec, 100).unwrap();
            replace_messages(
                &conn,
                &rec.session_id,
                &[message(0, Role::User, "retry logic with backoff")],
            )
            .unwrap();
        }

        let hits = find_similar(&conn, "backoff", 10).unwrap();
        assert_eq!(hits.len(), 2, "one best hit per project");
    }

    #[test]
    fn pagination_computes_totals() {
        let conn = test_conn();
        upsert_conversation(&conn, &conversation("s1"), 100).unwrap();
        let msgs: Vec<MessageRecord> = (0..120)
            .map(|i| message(i, Role::Assistant, &format!("msg {}", i)))
            .collect();
        replace_messages(&conn, "s1", &msgs).unwrap();

        let page = conversation_messages(&conn, "s1", 2, 50).unwrap();
        assert_eq!(page.total_messages, 120);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.messages.len(), 50);
        assert_eq!(page.messages[0].idx, 50);

        let last = conversation_messages(&conn, "s1", 3, 50).unwrap();
        assert_eq!(last.messages.len(), 20);
    }

    #[test]
    fn pagination_clamps_page_size() {
        let conn = test_conn();
        upsert_conversation(&conn, &conversation("s1"), 100).unwrap();
        replace_messages(&conn, "s1", &[message(0, Role::User, "hi")]).unwrap();

        let page = conversation_messages(&conn, "s1", 1, 9999).unwrap();
        assert_eq!(page.page_size, 500);
    }

    #[test]
    fn restore_point_labels_are_unique_per_repo() {
        let conn = test_conn();
        let hash = "a".repeat(40);
        create_restore_point(&conn, "/r", "before", &hash, "", 100).unwrap();
        let dup = create_restore_point(&conn, "/r", "before", &hash, "", 200);
        assert!(dup.is_err());

        // Same label in another repo is fine.
        create_restore_point(&conn, "/other", "before", &hash, "", 100).unwrap();
    }

    #[test]
    fn restore_points_list_newest_first() {
        let conn = test_conn();
        let hash = "b".repeat(40);
        create_restore_point(&conn, "/r", "one", &hash, "", 100).unwrap();
        create_restore_point(&conn, "/r", "two", &hash, "", 200).unwrap();

        let points = list_restore_points(&conn, "/r", 10).unwrap();
        assert_eq!(points[0].label, "two");
        assert_eq!(points[1].label, "one");
    }

    #[test]
    fn shadow_commit_round_trips_files() {
        let conn = test_conn();
        let rec = ShadowCommitRecord {
            commit_hash: "c".repeat(40),
            shadow_branch: "shadow/main".to_string(),
            original_branch: "main".to_string(),
            repo_root: "/r".to_string(),
            files: vec!["src/a.txt".to_string()],
            message: "Auto-save: a.txt - shadow/main".to_string(),
            session_id: Some("s1".to_string()),
            confidence: 0.8,
            created_at: 100,
        };
        record_shadow_commit(&conn, &rec).unwrap();

        let got = shadow_commits_for_session(&conn, "s1", 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], rec);
    }

    #[test]
    fn correlation_round_trips() {
        let conn = test_conn();
        let rec = CorrelationRecord {
            session_id: "s1".to_string(),
            commit_hash: "d".repeat(40),
            repo_root: "/r".to_string(),
            confidence: 0.5,
            created_at: 100,
        };
        record_correlation(&conn, &rec).unwrap();
        let got = session_for_commit(&conn, &rec.commit_hash).unwrap().unwrap();
        assert_eq!(got, rec);
    }

    #[test]
    fn repo_settings_round_trip_strict_bool() {
        let conn = test_conn();
        let mut settings = RepoSettings::defaults_for("/r");
        settings.enabled = false;
        settings.excludes = vec!["*.generated".to_string()];
        put_repo_settings(&conn, &settings).unwrap();

        let got = get_repo_settings(&conn, "/r").unwrap().unwrap();
        assert_eq!(got, settings);
    }

    #[test]
    fn repository_monorepo_flag_round_trips() {
        let conn = test_conn();
        let repo = RepositoryRecord {
            root: "/R".to_string(),
            remote_url: Some("git@example.com:me/r.git".to_string()),
            default_branch: Some("main".to_string()),
            is_monorepo_subdirectory: true,
            subdirectory: Some("ketchup".to_string()),
        };
        upsert_repository(&conn, &repo).unwrap();
        assert_eq!(get_repository(&conn, "/R").unwrap().unwrap(), repo);
    }

    #[test]
    fn indexer_state_upserts() {
        let conn = test_conn();
        put_indexer_state(&conn, "/t/a.jsonl", 100, 1000, 1001).unwrap();
        put_indexer_state(&conn, "/t/a.jsonl", 200, 2000, 2001).unwrap();

        let states = all_indexer_states(&conn).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states["/t/a.jsonl"].file_size, 200);

        remove_indexer_states(&conn, &["/t/a.jsonl".to_string()]).unwrap();
        assert!(all_indexer_states(&conn).unwrap().is_empty());
    }

    #[test]
    fn timeframe_shapes() {
        assert_eq!(parse_timeframe("30m"), Some(1800));
        assert_eq!(parse_timeframe("24h"), Some(86_400));
        assert_eq!(parse_timeframe("7d"), Some(7 * 86_400));
        assert_eq!(parse_timeframe("2w"), Some(14 * 86_400));
        assert_eq!(parse_timeframe("today"), Some(86_400));
        assert_eq!(parse_timeframe("soon"), None);
        assert_eq!(parse_timeframe(""), None);
    }

    #[test]
    fn strict_bool_rejects_other_values() {
        assert!(int_to_bool(0).is_ok());
        assert!(int_to_bool(1).is_ok());
        assert!(int_to_bool(2).is_err());
        assert!(int_to_bool(-1).is_err());
    }
}
