//! Tether — session orchestration and terminal reconciliation for AI chat
//! backends.
//!
//! Two subsystems carry the weight here: the session pool + queue manager,
//! which bound residency and serialize dispatch per model id through events,
//! and the terminal snapshot engine, which reconciles raw screen captures
//! from unmanaged CLI agents into append-only message history.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod session;
pub mod store;
pub mod terminal;
