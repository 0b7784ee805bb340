//! Pty-attached session
//!
//! Owns the message buffer and metadata for one terminal-backed session.
//! Snapshot captures flow through the extractor and the reconciliation
//! merger; the pool persists the record and emits the update events.

use chrono::Utc;

use crate::session::{SessionRecord, SessionStatus};
use crate::terminal::merge::{reconcile, MergeOutcome};
use crate::terminal::{extract_messages, profile_for};

pub struct PtySession {
    pub record: SessionRecord,
}

impl PtySession {
    pub fn new(record: SessionRecord) -> Self {
        Self { record }
    }

    fn agent(&self) -> &str {
        self.record.meta.agent.as_deref().unwrap_or("unknown")
    }

    /// Reconcile one terminal capture into history. An empty or whitespace
    /// snapshot is a no-op and never clears history. Snapshots after
    /// termination still apply; last write wins.
    pub fn apply_snapshot(&mut self, buffer: &str) -> Option<MergeOutcome> {
        let profile = profile_for(self.agent());
        let candidates = extract_messages(buffer, profile);
        if candidates.is_empty() {
            return None;
        }
        let outcome = reconcile(&mut self.record.messages, &candidates);
        self.record.updated_at = Utc::now().timestamp();
        Some(outcome)
    }

    pub fn mark_terminated(&mut self) {
        self.record.status = SessionStatus::ExternalTerminated;
        self.record.touch();
    }

    pub fn is_terminated(&self) -> bool {
        self.record.status == SessionStatus::ExternalTerminated
    }
}
