// crates/db/src/migrations.rs
//! Inline SQL migrations for the hindsight store.
//!
//! Simple numbered inline migrations with a `_migrations` tracking table;
//! each step runs inside its own transaction. The schema is small and
//! self-contained, so migration files would be overkill.

use rusqlite::Connection;

pub const MIGRATIONS: &[&str] = &[
    // Migration 1: conversations
    r#"
CREATE TABLE IF NOT EXISTS conversations (
    session_id      TEXT PRIMARY KEY,
    project_name    TEXT NOT NULL DEFAULT '',
    project_path    TEXT NOT NULL DEFAULT '',
    title           TEXT NOT NULL DEFAULT '',
    first_seen_at   INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL,
    message_count   INTEGER NOT NULL DEFAULT 0,
    token_count     INTEGER NOT NULL DEFAULT 0,
    source_path     TEXT NOT NULL DEFAULT '',
    CHECK (session_id <> '')
);
CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(last_updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_name);
"#,
    // Migration 2: messages (identity is (session_id, idx); the source uuid
    // is evidence only — the producer reuses it across sessions)
    r#"
CREATE TABLE IF NOT EXISTS messages (
    session_id  TEXT NOT NULL,
    idx         INTEGER NOT NULL,
    source_uuid TEXT,
    role        TEXT NOT NULL CHECK (role IN ('user','assistant','tool','system','summary')),
    content     TEXT NOT NULL DEFAULT '',
    content_kind TEXT NOT NULL CHECK (content_kind IN ('text','tool-use','tool-result','mixed')),
    created_at  INTEGER,
    PRIMARY KEY (session_id, idx)
);
"#,
    // Migration 3: full-text index over message content. External-content
    // FTS5 kept in sync by triggers; messages are only ever inserted and
    // deleted wholesale, never updated in place.
    r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content='messages',
    content_rowid='rowid',
    tokenize='porter unicode61'
);
CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
END;
"#,
    // Migration 4: repositories
    r#"
CREATE TABLE IF NOT EXISTS repositories (
    root                      TEXT PRIMARY KEY,
    remote_url                TEXT,
    default_branch            TEXT,
    is_monorepo_subdirectory  INTEGER NOT NULL DEFAULT 0 CHECK (is_monorepo_subdirectory IN (0, 1)),
    subdirectory              TEXT
);
"#,
    // Migration 5: shadow commits
    r#"
CREATE TABLE IF NOT EXISTS shadow_commits (
    commit_hash     TEXT PRIMARY KEY CHECK (length(commit_hash) = 40),
    shadow_branch   TEXT NOT NULL,
    original_branch TEXT NOT NULL,
    repo_root       TEXT NOT NULL,
    files_json      TEXT NOT NULL DEFAULT '[]',
    message         TEXT NOT NULL DEFAULT '',
    session_id      TEXT,
    confidence      REAL NOT NULL DEFAULT 0.0 CHECK (confidence >= 0.0 AND confidence <= 1.0),
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_shadow_commits_repo ON shadow_commits(repo_root, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_shadow_commits_session ON shadow_commits(session_id);
"#,
    // Migration 6: correlations
    r#"
CREATE TABLE IF NOT EXISTS correlations (
    session_id  TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    repo_root   TEXT NOT NULL,
    confidence  REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    created_at  INTEGER NOT NULL,
    PRIMARY KEY (session_id, commit_hash)
);
CREATE INDEX IF NOT EXISTS idx_correlations_commit ON correlations(commit_hash);
"#,
    // Migration 7: per-repository settings
    r#"
CREATE TABLE IF NOT EXISTS repo_settings (
    root           TEXT PRIMARY KEY,
    enabled        INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
    notify_mode    TEXT NOT NULL DEFAULT 'batched'
                   CHECK (notify_mode IN ('disabled','every-commit','batched','hourly')),
    excludes_json  TEXT NOT NULL DEFAULT '[]',
    throttle_secs  INTEGER NOT NULL DEFAULT 2,
    max_file_mb    INTEGER NOT NULL DEFAULT 10,
    branch_prefix  TEXT NOT NULL DEFAULT 'shadow/'
);
"#,
    // Migration 8: restore points
    r#"
CREATE TABLE IF NOT EXISTS restore_points (
    id          INTEGER PRIMARY KEY,
    repo_root   TEXT NOT NULL,
    label       TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at  INTEGER NOT NULL,
    UNIQUE (repo_root, label)
);
CREATE INDEX IF NOT EXISTS idx_restore_points_repo ON restore_points(repo_root, created_at DESC);
"#,
    // Migration 9: indexer progress state — lets the initial scan skip
    // files whose size and mtime are unchanged since the last index.
    r#"
CREATE TABLE IF NOT EXISTS indexer_state (
    source_path TEXT PRIMARY KEY,
    file_size   INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    indexed_at  INTEGER NOT NULL
);
"#,
];

/// Apply all unapplied migrations, each inside its own transaction.
pub fn apply_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)",
        [],
    )?;

    let current: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |r| {
            r.get(0)
        })?;

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO _migrations (version) VALUES (?1)", [version])?;
        tx.commit()?;
    }

    Ok(())
}
