//! Terminal snapshot reconciliation engine
//!
//! An attached terminal yields a full rendered screen buffer per capture,
//! not a diff. `extract` converts one buffer into ordered logical messages
//! using a per-agent marker profile; `merge` folds that candidate list into
//! the session's permanent history without re-adding recorded content and
//! without losing content that scrolled off between captures.

pub mod ansi;
pub mod extract;
pub mod merge;
pub mod profile;

pub use extract::{extract_messages, CandidateMessage};
pub use merge::{reconcile, MergeOutcome};
pub use profile::{profile_for, AgentProfile};
