// crates/core/src/types.rs
use serde::{Deserialize, Serialize};

/// Maximum title length derived from the first user message.
pub const TITLE_MAX_CHARS: usize = 50;

/// Maximum inline tool-result text before truncation with an ellipsis.
pub const TOOL_RESULT_MAX_CHARS: usize = 200;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    Summary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
            Role::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            "system" => Some(Role::System),
            "summary" => Some(Role::Summary),
            _ => None,
        }
    }
}

/// What kind of content a message carries after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    Text,
    ToolUse,
    ToolResult,
    Mixed,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::ToolUse => "tool-use",
            ContentKind::ToolResult => "tool-result",
            ContentKind::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Option<ContentKind> {
        match s {
            "text" => Some(ContentKind::Text),
            "tool-use" => Some(ContentKind::ToolUse),
            "tool-result" => Some(ContentKind::ToolResult),
            "mixed" => Some(ContentKind::Mixed),
            _ => None,
        }
    }
}

/// One message of a parsed conversation.
///
/// Identity inside the store is `(session_id, idx)` — the source uuid is
/// kept for correlation evidence but the producer reuses uuids across and
/// within sessions, so it is never treated as unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Dense ordinal within the conversation, starting at 0.
    pub idx: i64,
    pub role: Role,
    pub content: String,
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uuid: Option<String>,
    /// ISO-8601 timestamp from the source line, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MessageRecord {
    pub fn new(role: Role, content: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            idx: 0,
            role,
            content: content.into(),
            kind,
            source_uuid: None,
            timestamp: None,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.source_uuid = Some(uuid.into());
        self
    }

    pub fn with_timestamp(mut self, ts: impl Into<String>) -> Self {
        self.timestamp = Some(ts.into());
        self
    }
}

/// One conversation as derived from a single session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    /// Opaque session identifier. Never empty — fabricated when the source
    /// omits it.
    pub session_id: String,
    pub project_name: String,
    pub project_path: String,
    /// First user message, truncated to [`TITLE_MAX_CHARS`].
    pub title: String,
    pub message_count: i64,
    /// Approximate cumulative token count (content chars / 4).
    pub token_count: i64,
    /// Absolute path of the source .jsonl file.
    pub source_path: String,
}
