//! Session data model
//!
//! Defines the core record types shared by the pool, the queue manager and
//! the repository: backend kinds, session statuses, messages and script
//! provenance. Everything serializes snake_case for storage and the wire.

pub mod pool;
pub mod pty;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Backend kind
// ============================================================================

/// Which backend family a session is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Direct streaming chat-completions API
    Api,
    /// Vendor CLI agent attached through a pseudo-terminal
    TerminalAttached,
    /// Externally launched process/window
    ExternalProcess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::TerminalAttached => "terminal_attached",
            Self::ExternalProcess => "external_process",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "api" => Some(Self::Api),
            "terminal_attached" => Some(Self::TerminalAttached),
            "external_process" => Some(Self::ExternalProcess),
            _ => None,
        }
    }

    /// External-backed sessions live in the external pool map.
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Api)
    }
}

// ============================================================================
// Session status
// ============================================================================

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Processing,
    Scheduled,
    WaitingConfirmation,
    MaxTurnsReached,
    ExternalActive,
    ExternalTerminated,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Scheduled => "scheduled",
            Self::WaitingConfirmation => "waiting_confirmation",
            Self::MaxTurnsReached => "max_turns_reached",
            Self::ExternalActive => "external_active",
            Self::ExternalTerminated => "external_terminated",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "processing" => Some(Self::Processing),
            "scheduled" => Some(Self::Scheduled),
            "waiting_confirmation" => Some(Self::WaitingConfirmation),
            "max_turns_reached" => Some(Self::MaxTurnsReached),
            "external_active" => Some(Self::ExternalActive),
            "external_terminated" => Some(Self::ExternalTerminated),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// A status that keeps the dispatched model busy. The queue manager only
    /// releases a model when the session moves away from these.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::WaitingConfirmation)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

/// Message content: plain text or structured JSON (tool payloads)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Structured(_) => None,
        }
    }

    /// Flatten to text for comparison and logging.
    pub fn display_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Structured(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: i64,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: MessageContent::Text(content.into()),
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn structured(role: Role, value: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: MessageContent::Structured(value),
            created_at: Utc::now().timestamp(),
        }
    }
}

// ============================================================================
// Tool calls
// ============================================================================

/// A tool invocation the backend asked to run, awaiting user confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

// ============================================================================
// Script provenance
// ============================================================================

/// Where the session's backing script came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProvenance {
    pub path: String,
    pub content_hash: String,
    pub modified_at: i64,
    pub snapshot: Option<String>,
}

/// Hex sha-256 of script content, used by `find_by_script_hash`.
pub fn script_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

// ============================================================================
// Session record
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub model_id: Option<String>,
    /// Draft prompt consumed by the queue manager at dispatch time
    pub draft: Option<String>,
    #[serde(default)]
    pub turns_used: u32,
    #[serde(default)]
    pub max_turns: u32,
    #[serde(default)]
    pub pending_calls: Vec<ToolCallRequest>,
    /// CLI agent profile hint for terminal-attached sessions
    pub agent: Option<String>,
    /// External process linkage
    pub external_pid: Option<u32>,
    pub external_window: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Immutable identity
    pub id: String,
    /// Backing resource path; at most one resident session per path
    pub path: String,
    pub kind: BackendKind,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub meta: SessionMeta,
    pub script: Option<ScriptProvenance>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionRecord {
    pub fn new(path: impl Into<String>, kind: BackendKind) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            kind,
            status: SessionStatus::Idle,
            messages: Vec::new(),
            meta: SessionMeta::default(),
            script: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp();
    }

    /// Append-only except for the bounded anchor-truncate in reconciliation.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Idle,
            SessionStatus::Processing,
            SessionStatus::Scheduled,
            SessionStatus::WaitingConfirmation,
            SessionStatus::MaxTurnsReached,
            SessionStatus::ExternalActive,
            SessionStatus::ExternalTerminated,
            SessionStatus::Error,
        ] {
            assert_eq!(SessionStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            BackendKind::Api,
            BackendKind::TerminalAttached,
            BackendKind::ExternalProcess,
        ] {
            assert_eq!(BackendKind::from_str(kind.as_str()), Some(kind));
        }
        assert!(BackendKind::Api.is_external() == false);
        assert!(BackendKind::TerminalAttached.is_external());
    }

    #[test]
    fn test_script_hash_stable() {
        let a = script_hash("print('hello')");
        let b = script_hash("print('hello')");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, script_hash("print('bye')"));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let mut record = SessionRecord::new("/tmp/chat.md", BackendKind::Api);
        record.meta.model_id = Some("deepseek-chat".into());
        record.push_message(Message::text(Role::User, "hello"));
        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
