// crates/core/src/parser.rs
//! Streaming JSONL transcript parser.
//!
//! Reads one session file line by line, repairs malformed escape sequences,
//! and produces a conversation record plus a dense ordered list of message
//! records — the full replacement set for that conversation. A bad line is
//! counted and skipped; it never aborts the file.

use crate::error::ParseError;
use crate::sanitize::sanitize_line;
use crate::types::*;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Result of parsing one session file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTranscript {
    pub conversation: ConversationRecord,
    /// Dense, ordered replacement set; `idx` runs 0..n.
    pub messages: Vec<MessageRecord>,
    /// Lines that failed to decode even after sanitizing.
    pub skipped_lines: usize,
}

/// Parse a session JSONL file into a [`ParsedTranscript`].
///
/// Derivations:
/// - session identifier: first non-empty `sessionId`, else the file stem,
///   else a fresh v4 uuid (the result is never empty)
/// - project path: first non-empty `cwd`; project name is its last component
/// - title: first user message, truncated to [`TITLE_MAX_CHARS`]
/// - token count: cumulative content chars / 4
///
/// `summary`-typed lines are skipped; unknown line types are ignored for
/// forward compatibility.
pub async fn parse_transcript(file_path: &Path) -> Result<ParsedTranscript, ParseError> {
    let file = File::open(file_path)
        .await
        .map_err(|e| ParseError::io(file_path, e))?;

    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let mut messages: Vec<MessageRecord> = Vec::new();
    let mut skipped_lines: usize = 0;
    let mut line_number: usize = 0;
    let mut session_id: Option<String> = None;
    let mut project_path: Option<String> = None;

    while let Some(raw) = lines
        .next_line()
        .await
        .map_err(|e| ParseError::io(file_path, e))?
    {
        line_number += 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let repaired = sanitize_line(line);
        let value: serde_json::Value = match serde_json::from_str(repaired.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                debug!(line = line_number, file = ?file_path, error = %e, "skipping undecodable line");
                skipped_lines += 1;
                continue;
            }
        };

        // First non-empty sessionId / cwd wins, wherever it appears.
        if session_id.is_none() {
            if let Some(sid) = value.get("sessionId").and_then(|v| v.as_str()) {
                if !sid.is_empty() {
                    session_id = Some(sid.to_string());
                }
            }
        }
        if project_path.is_none() {
            if let Some(cwd) = value.get("cwd").and_then(|v| v.as_str()) {
                if !cwd.is_empty() {
                    project_path = Some(cwd.to_string());
                }
            }
        }

        let entry_type = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => t,
            None => {
                debug!(line = line_number, "line has no type field, ignoring");
                continue;
            }
        };

        match entry_type {
            "user" | "assistant" => {
                let (content, kind) = extract_content(value.get("message"));
                let role = match (entry_type, kind) {
                    // A user line whose content is tool results is the tool
                    // talking back, not the user.
                    ("user", ContentKind::ToolResult) => Role::Tool,
                    ("user", _) => Role::User,
                    _ => Role::Assistant,
                };

                let mut message = MessageRecord::new(role, content, kind);
                if let Some(uuid) = value.get("uuid").and_then(|v| v.as_str()) {
                    message = message.with_uuid(uuid);
                }
                if let Some(ts) = value.get("timestamp").and_then(|v| v.as_str()) {
                    message = message.with_timestamp(ts);
                }
                messages.push(message);
            }
            "summary" => {
                // Session summaries are bookkeeping, not conversation.
                continue;
            }
            other => {
                debug!(line = line_number, entry_type = other, "ignoring unknown line type");
            }
        }
    }

    // Assign dense ordinals now that the set is final.
    for (idx, message) in messages.iter_mut().enumerate() {
        message.idx = idx as i64;
    }

    let session_id = session_id
        .or_else(|| {
            file_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let project_path = project_path.unwrap_or_default();
    let project_name = if project_path.is_empty() {
        "unknown".to_string()
    } else {
        Path::new(&project_path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };

    let title = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| truncate_chars(&m.content, TITLE_MAX_CHARS))
        .unwrap_or_default();

    let token_count: i64 = messages
        .iter()
        .map(|m| m.content.chars().count() as i64 / 4)
        .sum();

    let conversation = ConversationRecord {
        session_id,
        project_name,
        project_path,
        title,
        message_count: messages.len() as i64,
        token_count,
        source_path: file_path.to_string_lossy().to_string(),
    };

    Ok(ParsedTranscript {
        conversation,
        messages,
        skipped_lines,
    })
}

/// Extract a single content string and its kind from a `message` field.
///
/// String content is taken as-is. Part arrays are flattened: text parts are
/// joined with a single space, tool uses become `[Tool: name]`, and tool
/// results are truncated to [`TOOL_RESULT_MAX_CHARS`] with an ellipsis.
fn extract_content(message: Option<&serde_json::Value>) -> (String, ContentKind) {
    let content = match message.and_then(|m| m.get("content")) {
        Some(c) => c,
        None => return (String::new(), ContentKind::Text),
    };

    match content {
        serde_json::Value::String(s) => (s.clone(), ContentKind::Text),
        serde_json::Value::Array(parts) => {
            let mut pieces: Vec<String> = Vec::new();
            let mut has_text = false;
            let mut has_tool_use = false;
            let mut has_tool_result = false;

            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            has_text = true;
                            pieces.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let name = part
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown");
                        has_tool_use = true;
                        pieces.push(format!("[Tool: {}]", name));
                    }
                    Some("tool_result") => {
                        has_tool_result = true;
                        pieces.push(tool_result_text(part.get("content")));
                    }
                    _ => {}
                }
            }

            let kind = match (has_text, has_tool_use, has_tool_result) {
                (_, true, true) | (true, true, false) | (true, false, true) => ContentKind::Mixed,
                (false, true, false) => ContentKind::ToolUse,
                (false, false, true) => ContentKind::ToolResult,
                _ => ContentKind::Text,
            };

            (pieces.join(" "), kind)
        }
        _ => (String::new(), ContentKind::Text),
    }
}

/// Render a tool_result content value as display text, truncated.
fn tool_result_text(content: Option<&serde_json::Value>) -> String {
    let text = match content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                if item.get("type").and_then(|t| t.as_str()) == Some("text") {
                    item.get("text").and_then(|t| t.as_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    if text.chars().count() > TOOL_RESULT_MAX_CHARS {
        format!("{}...", truncate_chars(&text, TOOL_RESULT_MAX_CHARS))
    } else {
        text
    }
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
