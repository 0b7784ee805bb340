//! Reconciliation merger
//!
//! Folds a fresh candidate list into existing history via anchor matching:
//! the newest existing message that also appears in the candidates is the
//! splice point. Everything after the anchor is re-derived scrollback and is
//! replaced by the candidate tail. With no anchor the whole candidate list
//! is appended; occasional duplication beats silent loss.

use similar::TextDiff;

use crate::session::Message;
use crate::terminal::extract::CandidateMessage;

/// Minimum `similar` ratio for two normalized texts to count as the same
/// logical message. Snapshot re-renders shift wrapping and trailing chrome,
/// so exact equality is too strict; 0.90 tolerates that while keeping
/// distinct messages apart.
pub const ANCHOR_SIMILARITY: f32 = 0.90;

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Find the candidate matching an existing message, or None.
pub fn anchor_match(existing: &Message, candidates: &[CandidateMessage]) -> Option<usize> {
    let existing_text = normalize(&existing.content.display_text());
    if existing_text.is_empty() {
        return None;
    }
    for (j, candidate) in candidates.iter().enumerate() {
        if candidate.role != existing.role {
            continue;
        }
        let candidate_text = normalize(&candidate.text);
        if candidate_text == existing_text {
            return Some(j);
        }
        if TextDiff::from_chars(existing_text.as_str(), candidate_text.as_str()).ratio()
            >= ANCHOR_SIMILARITY
        {
            return Some(j);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub appended: usize,
    pub truncated: usize,
    pub anchored: bool,
}

/// Merge candidates into existing history. Scans existing newest→oldest for
/// an anchor; messages [0..=anchor] are never touched (prefix stability).
pub fn reconcile(existing: &mut Vec<Message>, candidates: &[CandidateMessage]) -> MergeOutcome {
    if candidates.is_empty() {
        return MergeOutcome {
            appended: 0,
            truncated: 0,
            anchored: false,
        };
    }

    for i in (0..existing.len()).rev() {
        if let Some(j) = anchor_match(&existing[i], candidates) {
            let truncated = existing.len() - i - 1;
            existing.truncate(i + 1);
            let tail = &candidates[j + 1..];
            existing.extend(tail.iter().map(|c| c.to_message()));
            return MergeOutcome {
                appended: tail.len(),
                truncated,
                anchored: true,
            };
        }
    }

    existing.extend(candidates.iter().map(|c| c.to_message()));
    MergeOutcome {
        appended: candidates.len(),
        truncated: 0,
        anchored: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    fn msg(role: Role, text: &str) -> Message {
        Message::text(role, text)
    }

    fn cand(role: Role, text: &str) -> CandidateMessage {
        CandidateMessage::new(role, text)
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.content.display_text()).collect()
    }

    #[test]
    fn test_overlapping_snapshots_share_message_once() {
        let mut existing = vec![
            msg(Role::User, "explain the build error"),
            msg(Role::Assistant, "The linker is missing libfoo."),
        ];
        // Second capture re-derives the assistant message and adds new tail.
        let candidates = vec![
            cand(Role::Assistant, "The linker is missing libfoo."),
            cand(Role::User, "how do I install it?"),
            cand(Role::Assistant, "apt install libfoo-dev"),
        ];
        let outcome = reconcile(&mut existing, &candidates);
        assert!(outcome.anchored);
        assert_eq!(outcome.appended, 2);
        assert_eq!(
            texts(&existing),
            vec![
                "explain the build error",
                "The linker is missing libfoo.",
                "how do I install it?",
                "apt install libfoo-dev",
            ]
        );
    }

    #[test]
    fn test_prefix_stable_through_anchor() {
        let mut existing = vec![
            msg(Role::System, "cli:start"),
            msg(Role::User, "hello"),
            msg(Role::Assistant, "hi there"),
        ];
        let before_ids: Vec<String> = existing[..2].iter().map(|m| m.id.clone()).collect();

        let candidates = vec![
            cand(Role::User, "hello"),
            cand(Role::Assistant, "hi there, how can I help?"),
        ];
        let outcome = reconcile(&mut existing, &candidates);
        assert!(outcome.anchored);
        // Anchor landed on "hello"; everything at or before it is untouched.
        let after_ids: Vec<String> = existing[..2].iter().map(|m| m.id.clone()).collect();
        assert_eq!(before_ids, after_ids);
    }

    #[test]
    fn test_no_anchor_appends_everything() {
        let mut existing = vec![msg(Role::User, "old conversation")];
        let candidates = vec![
            cand(Role::System, "cli:start"),
            cand(Role::User, "fresh start after clear"),
        ];
        let outcome = reconcile(&mut existing, &candidates);
        assert!(!outcome.anchored);
        assert_eq!(outcome.appended, 2);
        assert_eq!(existing.len(), 3);
    }

    #[test]
    fn test_empty_candidates_noop() {
        let mut existing = vec![msg(Role::User, "keep me")];
        let outcome = reconcile(&mut existing, &[]);
        assert_eq!(outcome.appended, 0);
        assert_eq!(existing.len(), 1);
    }

    #[test]
    fn test_anchor_tolerates_rewrapping() {
        let existing = msg(Role::Assistant, "The quick brown fox jumps over the lazy dog");
        let candidates = vec![cand(
            Role::Assistant,
            "The quick brown fox\njumps over the lazy dog",
        )];
        assert_eq!(anchor_match(&existing, &candidates), Some(0));
    }

    #[test]
    fn test_anchor_requires_same_role() {
        let existing = msg(Role::Assistant, "identical text");
        let candidates = vec![cand(Role::User, "identical text")];
        assert_eq!(anchor_match(&existing, &candidates), None);
    }

    #[test]
    fn test_anchor_rejects_dissimilar_text() {
        let existing = msg(Role::Assistant, "completely different subject matter");
        let candidates = vec![cand(Role::Assistant, "nothing alike whatsoever here")];
        assert_eq!(anchor_match(&existing, &candidates), None);
    }

    #[test]
    fn test_newest_anchor_wins() {
        let mut existing = vec![
            msg(Role::User, "repeat"),
            msg(Role::Assistant, "ok"),
            msg(Role::User, "repeat"),
        ];
        let candidates = vec![cand(Role::User, "repeat"), cand(Role::Assistant, "done")];
        let outcome = reconcile(&mut existing, &candidates);
        assert!(outcome.anchored);
        // Scanned newest→oldest: the later "repeat" is the anchor.
        assert_eq!(
            texts(&existing),
            vec!["repeat", "ok", "repeat", "done"]
        );
    }
}
