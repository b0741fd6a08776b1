//! Database schema definitions for the memory system
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sparse optional attributes attached to a message.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A resumable conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    ToolCall,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::ToolCall => "tool-call",
        }
    }

    /// Only conversational turns are embedded.
    pub fn is_embeddable(&self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            "tool-call" | "tool_call" => Ok(Role::ToolCall),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One stored turn. Immutable after insert except for the embedding columns,
/// which the embedding worker fills later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub session_id: String,
    pub chunk_index: i64,
    pub role: Role,
    pub content: String,
    pub tokens: usize,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    /// Set only once an embedding exists for this row.
    pub embedding_model: Option<String>,
}

impl StoredMessage {
    pub fn has_embedding(&self) -> bool {
        self.embedding_model.is_some()
    }
}

/// Inclusive timestamp window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Row filters shared by the keyword and vector indexes.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub session_id: Option<String>,
    /// Every pair must match exactly (JSON equality on the metadata column).
    pub metadata: Option<Metadata>,
    pub time_range: Option<TimeRange>,
}

impl SearchFilter {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.metadata = metadata.filter(|m| !m.is_empty());
        self
    }

    pub fn with_time_range(mut self, time_range: Option<TimeRange>) -> Self {
        self.time_range = time_range;
        self
    }
}

/// Ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub message: StoredMessage,
    pub score: f32,
    pub source: SearchSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Semantic,
    Keyword,
    Hybrid,
}

impl fmt::Display for SearchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchSource::Semantic => "semantic",
            SearchSource::Keyword => "keyword",
            SearchSource::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub embedded_messages: i64,
    pub database_size_bytes: i64,
}

/// Fixed-width UTC timestamp so lexical order in SQLite equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

/// Column list shared by every query that materializes a `StoredMessage`.
pub(crate) const MESSAGE_COLUMNS: &str =
    "m.message_id, m.session_id, m.chunk_index, m.role, m.content, m.tokens, m.timestamp, m.metadata, m.embedding_model";
