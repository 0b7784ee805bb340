//! Backend adapters
//!
//! Every backend family exposes the same `send_message` shape; the queue
//! manager picks the adapter from the model id's terminal-class membership.
//! Terminal-class and external-process dispatch go through the
//! `ExternalChatRunner` collaborator; the streaming API adapter lives here.

pub mod api;

pub use api::ApiBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::{Message, Role, ToolCallRequest};

// ============================================================================
// Turn protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextSpeaker {
    User,
    Agent,
}

/// Input for one sub-turn: the user's prompt, a synthesized continuation, or
/// a confirmed tool result.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub role: Role,
    pub text: String,
}

impl TurnInput {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            text: text.into(),
        }
    }

    /// Synthesized input when the next-speaker policy keeps the agent talking.
    pub fn continuation() -> Self {
        Self::user("Continue.")
    }
}

/// What one backend invocation produced
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    /// New messages in arrival order (assistant text, tool traffic)
    pub messages: Vec<Message>,
    /// Tool calls awaiting user confirmation; non-empty parks the session in
    /// waiting_confirmation
    pub pending_calls: Vec<ToolCallRequest>,
    /// Backend's own read on who should speak next
    pub next_speaker: Option<NextSpeaker>,
}

/// Decide who speaks next after a completed sub-turn. The backend hint wins;
/// without one the turn goes back to the user.
pub fn next_speaker(result: &TurnResult) -> NextSpeaker {
    result.next_speaker.unwrap_or(NextSpeaker::User)
}

// ============================================================================
// Adapter traits
// ============================================================================

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(
        &self,
        path: &str,
        session_id: &str,
        input: &TurnInput,
        history: &[Message],
    ) -> anyhow::Result<TurnResult>;

    fn name(&self) -> &'static str;
}

/// Collaborator that drives terminal-class and external-process chats. The
/// window/IPC plumbing behind it is out of scope here.
#[async_trait]
pub trait ExternalChatRunner: Send + Sync {
    async fn send_message(&self, path: &str, session_id: &str, input: &str) -> anyhow::Result<()>;
}

/// File existence probe, used only for queue self-healing.
pub trait ExistenceProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

pub struct FsProbe;

impl ExistenceProbe for FsProbe {
    fn exists(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_speaker_defaults_to_user() {
        let result = TurnResult::default();
        assert_eq!(next_speaker(&result), NextSpeaker::User);
    }

    #[test]
    fn test_next_speaker_honors_hint() {
        let result = TurnResult {
            next_speaker: Some(NextSpeaker::Agent),
            ..Default::default()
        };
        assert_eq!(next_speaker(&result), NextSpeaker::Agent);
    }
}
