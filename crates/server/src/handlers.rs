// crates/server/src/handlers.rs
//! Method implementations behind the JSON-RPC surface.
//!
//! Fault messages are sanitized at this boundary: no absolute paths, no
//! file content, no raw stderr — callers get the error class, not the
//! evidence.

use hindsight_core::ErrorClass;
use hindsight_db::StoreError;
use hindsight_git::{run_git, GitCommand, GitError};
use hindsight_shadow::ShadowError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::state::AppState;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_PARAMS: i64 = -32602;
pub const STORE_ERROR: i64 = -32000;
pub const GIT_ERROR: i64 = -32001;
pub const CORRELATION_ERROR: i64 = -32002;
pub const RESOURCE_LIMIT: i64 = -32003;

/// A fault ready to serialize as a JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFault {
    pub code: i64,
    pub message: String,
}

impl RpcFault {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn resource_limit() -> Self {
        Self {
            code: RESOURCE_LIMIT,
            message: "request queue is full".to_string(),
        }
    }
}

impl From<StoreError> for RpcFault {
    fn from(e: StoreError) -> Self {
        match e.class() {
            ErrorClass::PermanentCaller => RpcFault {
                code: INVALID_PARAMS,
                message: e.to_string(),
            },
            class => RpcFault {
                code: STORE_ERROR,
                message: format!("store error ({class})"),
            },
        }
    }
}

impl From<GitError> for RpcFault {
    fn from(e: GitError) -> Self {
        // Class only: stderr may carry repository paths.
        RpcFault {
            code: GIT_ERROR,
            message: format!("git error ({})", e.class()),
        }
    }
}

impl From<ShadowError> for RpcFault {
    fn from(e: ShadowError) -> Self {
        match e {
            caller @ (ShadowError::InvalidLabel | ShadowError::UnknownRestorePoint { .. }) => {
                RpcFault {
                    code: INVALID_PARAMS,
                    message: caller.to_string(),
                }
            }
            ShadowError::Git(e) => e.into(),
            ShadowError::Store(e) => e.into(),
            other => RpcFault {
                code: STORE_ERROR,
                message: format!("engine error ({})", other.class()),
            },
        }
    }
}

fn params<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, RpcFault> {
    // Absent params arrive as null; treat that as an empty object so
    // methods with all-optional parameters work without a params field.
    let value = if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| RpcFault::invalid_params(format!("invalid params: {e}")))
}

// ============================================================================
// Parameter shapes
// ============================================================================

fn d_limit_20() -> i64 {
    20
}
fn d_limit_10() -> i64 {
    10
}
fn d_limit_5() -> i64 {
    5
}
fn d_page() -> i64 {
    1
}
fn d_page_size() -> i64 {
    50
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchParams {
    query: String,
    timeframe: Option<String>,
    #[serde(default = "d_limit_20")]
    limit: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListRecentParams {
    #[serde(default = "d_limit_10")]
    limit: i64,
    timeframe: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ContextParams {
    session_id: String,
    #[serde(default = "d_page")]
    page: i64,
    #[serde(default = "d_page_size")]
    page_size: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SimilarParams {
    query: String,
    #[serde(default = "d_limit_5")]
    limit: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MetricsParams {
    window_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GitContextParams {
    project_path: PathBuf,
    #[serde(default = "d_limit_20")]
    limit: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateRestoreParams {
    project_path: PathBuf,
    label: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListRestoreParams {
    project_path: PathBuf,
    #[serde(default = "d_limit_20")]
    limit: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RestoreTargetParams {
    project_path: PathBuf,
    restore_point_id: i64,
}

// ============================================================================
// Dispatch
// ============================================================================

pub async fn dispatch(state: &AppState, method: &str, raw: Value) -> Result<Value, RpcFault> {
    match method {
        "search_conversations" => search_conversations(state, params(raw)?).await,
        "list_recent_conversations" => list_recent_conversations(state, params(raw)?).await,
        "get_conversation_context" => get_conversation_context(state, params(raw)?).await,
        "find_similar_solutions" => find_similar_solutions(state, params(raw)?).await,
        "health_check" => health_check(state).await,
        "performance_metrics" => performance_metrics(state, params(raw)?).await,
        "get_git_context" => get_git_context(state, params(raw)?).await,
        "create_restore_point" => create_restore_point(state, params(raw)?).await,
        "list_restore_points" => list_restore_points(state, params(raw)?).await,
        "preview_restore" => preview_restore(state, params(raw)?).await,
        "restore_project_state" => restore_project_state(state, params(raw)?).await,
        other => Err(RpcFault::invalid_params(format!("unknown method: {other}"))),
    }
}

async fn search_conversations(state: &AppState, p: SearchParams) -> Result<Value, RpcFault> {
    let results = state
        .store
        .search_with_timeframe(&p.query, p.limit.clamp(1, 100), p.timeframe.as_deref())
        .await?;

    let hits: Vec<Value> = results
        .hits
        .iter()
        .map(|h| {
            json!({
                "sessionId": h.session_id,
                "projectName": h.project_name,
                "messageCount": h.message_count,
                "preview": h.preview,
            })
        })
        .collect();

    Ok(json!({
        "query": p.query,
        "results": hits,
        "total_found": results.total_found,
        "showing": hits.len(),
    }))
}

async fn list_recent_conversations(state: &AppState, p: ListRecentParams) -> Result<Value, RpcFault> {
    let rows = state
        .store
        .list_recent(p.limit.clamp(1, 100), p.timeframe.as_deref())
        .await?;
    let list: Vec<Value> = rows
        .iter()
        .map(|c| {
            json!({
                "sessionId": c.session_id,
                "projectName": c.project_name,
                "lastUpdated": c.last_updated,
                "messageCount": c.message_count,
            })
        })
        .collect();
    Ok(Value::Array(list))
}

async fn get_conversation_context(state: &AppState, p: ContextParams) -> Result<Value, RpcFault> {
    if state.store.conversation(&p.session_id).await?.is_none() {
        return Err(RpcFault::invalid_params("unknown session"));
    }
    let page = state
        .store
        .conversation_messages(&p.session_id, p.page, p.page_size)
        .await?;

    let messages: Vec<Value> = page
        .messages
        .iter()
        .map(|m| {
            json!({
                "index": m.idx,
                "role": m.role,
                "content": m.content,
                "timestamp": m.timestamp,
            })
        })
        .collect();

    Ok(json!({
        "sessionId": page.session_id,
        "page": page.page,
        "pageSize": page.page_size,
        "totalPages": page.total_pages,
        "totalMessages": page.total_messages,
        "messages": messages,
    }))
}

async fn find_similar_solutions(state: &AppState, p: SimilarParams) -> Result<Value, RpcFault> {
    let hits = state
        .store
        .find_similar(&p.query, p.limit.clamp(1, 50))
        .await?;
    let results: Vec<Value> = hits
        .iter()
        .map(|h| {
            json!({
                "sessionId": h.session_id,
                "projectName": h.project_name,
                "preview": h.preview,
            })
        })
        .collect();
    Ok(json!({ "query": p.query, "results": results }))
}

async fn health_check(state: &AppState) -> Result<Value, RpcFault> {
    let stats = state.store.stats().await?;
    let db_size_mb = state.store.db_size_bytes() as f64 / (1024.0 * 1024.0);
    Ok(json!({
        "integrity": state.store.integrity().as_str(),
        "conversations": stats.conversations,
        "messages": stats.messages,
        "dbSizeMB": (db_size_mb * 100.0).round() / 100.0,
    }))
}

async fn performance_metrics(state: &AppState, p: MetricsParams) -> Result<Value, RpcFault> {
    let window = p.window_ms.map(std::time::Duration::from_millis);
    let methods = state.metrics.snapshot(window);
    Ok(json!({
        "windowMs": p.window_ms,
        "methods": methods,
    }))
}

async fn get_git_context(state: &AppState, p: GitContextParams) -> Result<Value, RpcFault> {
    let resolved = state.resolver.resolve(&p.project_path).await?;

    let subdir = resolved
        .is_monorepo_subdirectory
        .then(|| resolved.subdirectory.clone());
    let log = run_git(
        &resolved.root,
        &GitCommand::Log {
            limit: p.limit.clamp(1, 200) as usize,
            subdir: subdir.clone(),
        },
    )
    .await?;

    let commits: Vec<Value> = log.lines().filter_map(parse_log_line).collect();

    Ok(json!({
        "repositoryRoot": resolved.root.to_string_lossy(),
        "subdirectoryPath": subdir,
        "is_monorepo_subdirectory": resolved.is_monorepo_subdirectory,
        "currentBranch": resolved.current_branch,
        "remoteUrl": resolved.remote_url,
        "commits": commits,
    }))
}

/// Parse one `%H|%an|%at|%s` log line.
fn parse_log_line(line: &str) -> Option<Value> {
    let mut parts = line.splitn(4, '|');
    let hash = parts.next()?.trim();
    let author = parts.next()?.trim();
    let timestamp: i64 = parts.next()?.trim().parse().ok()?;
    let subject = parts.next()?.trim();
    if hash.len() != 40 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(json!({
        "hash": hash,
        "author": author,
        "timestamp": chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        "message": subject,
    }))
}

async fn create_restore_point(state: &AppState, p: CreateRestoreParams) -> Result<Value, RpcFault> {
    let resolved = state.resolver.resolve(&p.project_path).await?;
    let row = state
        .restore
        .create(&resolved.root, &p.label, &p.description)
        .await?;
    Ok(json!({ "id": row.id, "hash": row.commit_hash }))
}

async fn list_restore_points(state: &AppState, p: ListRestoreParams) -> Result<Value, RpcFault> {
    let resolved = state.resolver.resolve(&p.project_path).await?;
    let rows = state
        .restore
        .list(&resolved.root, p.limit.clamp(1, 200))
        .await?;
    let list: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "label": r.label,
                "hash": r.commit_hash,
                "description": r.description,
                "createdAt": r.created_at,
            })
        })
        .collect();
    Ok(Value::Array(list))
}

async fn preview_restore(state: &AppState, p: RestoreTargetParams) -> Result<Value, RpcFault> {
    let resolved = state.resolver.resolve(&p.project_path).await?;
    let plan = state
        .restore
        .preview(&resolved.root, p.restore_point_id)
        .await?;
    Ok(json!({
        "restorePoint": {
            "id": plan.restore_point.id,
            "label": plan.restore_point.label,
            "hash": plan.restore_point.commit_hash,
        },
        "filesChanged": plan.files_changed,
        "commands": plan.commands,
    }))
}

async fn restore_project_state(state: &AppState, p: RestoreTargetParams) -> Result<Value, RpcFault> {
    let resolved = state.resolver.resolve(&p.project_path).await?;
    let outcome = state
        .restore
        .restore(&resolved.root, p.restore_point_id)
        .await?;
    Ok(json!({
        "restored": {
            "id": outcome.restored.id,
            "label": outcome.restored.label,
            "hash": outcome.restored.commit_hash,
        },
        "safety": {
            "id": outcome.safety.id,
            "label": outcome.safety.label,
            "hash": outcome.safety.commit_hash,
        },
    }))
}
