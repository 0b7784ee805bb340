//! Session pool and turn loop
//!
//! Two bounded resident maps (api-backed, external-backed) keyed by resource
//! path, an access-tick index for LRU eviction, and the turn-execution loop.
//! All session mutation funnels through this type; the queue manager and the
//! watcher glue never touch the maps directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{next_speaker, ChatBackend, NextSpeaker, TurnInput};
use crate::error::{Result, SessionError};
use crate::events::{ChatEvent, ChatUpdateKind, EventBus};
use crate::session::pty::PtySession;
use crate::session::{
    script_hash, BackendKind, Message, Role, ScriptProvenance, SessionRecord, SessionStatus,
};
use crate::store::SessionRepository;
use crate::terminal::merge::MergeOutcome;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Resident capacity of each map; the api and external pools evict
    /// independently of each other.
    pub capacity: usize,
    /// Turn-loop cap per session, counting sub-turns
    pub max_turns: u32,
    /// Registered project roots; empty disables scoping entirely
    pub project_roots: Vec<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            max_turns: 24,
            project_roots: Vec::new(),
        }
    }
}

/// How a turn ended, as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnReport {
    Completed,
    WaitingConfirmation,
    MaxTurnsReached,
}

// ============================================================================
// Resident sessions
// ============================================================================

/// One in-memory session, tagged by backend family and switched exhaustively.
enum ResidentBody {
    Api(SessionRecord),
    Terminal(PtySession),
    External(SessionRecord),
}

struct Resident {
    body: ResidentBody,
    cancel: CancellationToken,
}

impl Resident {
    fn new(record: SessionRecord) -> Self {
        let body = match record.kind {
            BackendKind::Api => ResidentBody::Api(record),
            BackendKind::TerminalAttached => ResidentBody::Terminal(PtySession::new(record)),
            BackendKind::ExternalProcess => ResidentBody::External(record),
        };
        Self {
            body,
            cancel: CancellationToken::new(),
        }
    }

    fn record(&self) -> &SessionRecord {
        match &self.body {
            ResidentBody::Api(r) | ResidentBody::External(r) => r,
            ResidentBody::Terminal(pty) => &pty.record,
        }
    }

    fn record_mut(&mut self) -> &mut SessionRecord {
        match &mut self.body {
            ResidentBody::Api(r) | ResidentBody::External(r) => r,
            ResidentBody::Terminal(pty) => &mut pty.record,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    api: HashMap<String, Resident>,
    external: HashMap<String, Resident>,
    /// Monotonic access ticks shared by both maps; LRU is the minimum tick
    /// within one map.
    access: HashMap<String, u64>,
    tick: u64,
}

impl PoolInner {
    fn touch(&mut self, path: &str) {
        self.tick += 1;
        self.access.insert(path.to_string(), self.tick);
    }

    fn get(&self, path: &str) -> Option<&Resident> {
        self.api.get(path).or_else(|| self.external.get(path))
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Resident> {
        if self.api.contains_key(path) {
            return self.api.get_mut(path);
        }
        self.external.get_mut(path)
    }

    fn lru_path(&self, external: bool) -> Option<String> {
        let map = if external { &self.external } else { &self.api };
        map.keys()
            .min_by_key(|path| self.access.get(*path).copied().unwrap_or(0))
            .cloned()
    }
}

// ============================================================================
// Pool
// ============================================================================

pub struct SessionPool {
    repo: Arc<dyn SessionRepository>,
    backend: Arc<dyn ChatBackend>,
    events: EventBus,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        backend: Arc<dyn ChatBackend>,
        events: EventBus,
        config: PoolConfig,
    ) -> Self {
        Self {
            repo,
            backend,
            events,
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        path: &str,
        model_id: Option<String>,
    ) -> Result<SessionRecord> {
        self.check_scope(path)?;
        if self.load_record(path).await?.is_some() {
            return Err(SessionError::AlreadyExists(path.to_string()));
        }
        let mut record = SessionRecord::new(path, BackendKind::Api);
        record.meta.model_id = model_id;
        record.meta.max_turns = self.config.max_turns;
        record.script = load_provenance(path).await;
        self.repo.create(&record).await?;
        self.insert_resident(record.clone()).await?;
        info!(session_id = %record.id, path = %path, "Created api session");
        Ok(record)
    }

    /// Create a terminal-attached session when an agent hint is given, else
    /// an external-process session. Either way it starts external_active.
    pub async fn create_external_session(
        &self,
        path: &str,
        model_id: Option<String>,
        agent: Option<&str>,
    ) -> Result<SessionRecord> {
        self.check_scope(path)?;
        if self.load_record(path).await?.is_some() {
            return Err(SessionError::AlreadyExists(path.to_string()));
        }
        let kind = if agent.is_some() {
            BackendKind::TerminalAttached
        } else {
            BackendKind::ExternalProcess
        };
        let mut record = SessionRecord::new(path, kind);
        record.status = SessionStatus::ExternalActive;
        record.meta.model_id = model_id;
        record.meta.max_turns = self.config.max_turns;
        record.meta.agent = agent.map(str::to_string);
        record.script = load_provenance(path).await;
        self.repo.create(&record).await?;
        self.insert_resident(record.clone()).await?;
        info!(session_id = %record.id, path = %path, kind = kind.as_str(), "Created external session");
        Ok(record)
    }

    fn check_scope(&self, path: &str) -> Result<()> {
        if self.config.project_roots.is_empty() {
            return Ok(());
        }
        let target = Path::new(path);
        if self
            .config
            .project_roots
            .iter()
            .any(|root| target.starts_with(root))
        {
            Ok(())
        } else {
            Err(SessionError::OutOfScope(path.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Residency
    // ------------------------------------------------------------------

    /// Resident lookup refreshes the access tick; a repository miss is
    /// NotFound. Loading into a full pool evicts that pool's LRU resident
    /// (persist, then cleanup) before inserting.
    async fn checkout(&self, path: &str) -> Result<(SessionRecord, CancellationToken)> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(resident) = inner.get(path) {
                let record = resident.record().clone();
                let cancel = resident.cancel.clone();
                inner.touch(path);
                return Ok((record, cancel));
            }
        }

        let record = self
            .repo
            .find_by_script_path(path)
            .await?
            .ok_or_else(|| SessionError::NotFound(path.to_string()))?;
        let cancel = self.insert_resident(record.clone()).await?;
        Ok((record, cancel))
    }

    async fn insert_resident(&self, record: SessionRecord) -> Result<CancellationToken> {
        let external = record.kind.is_external();
        loop {
            let victim_path = {
                let mut inner = self.inner.lock().await;
                let len = if external {
                    inner.external.len()
                } else {
                    inner.api.len()
                };
                let replacing = if external {
                    inner.external.contains_key(&record.path)
                } else {
                    inner.api.contains_key(&record.path)
                };
                if replacing || len < self.config.capacity {
                    let resident = Resident::new(record.clone());
                    let cancel = resident.cancel.clone();
                    let path = record.path.clone();
                    // A path is resident in at most one of the two maps.
                    if external {
                        inner.api.remove(&path);
                        inner.external.insert(path.clone(), resident);
                    } else {
                        inner.external.remove(&path);
                        inner.api.insert(path.clone(), resident);
                    }
                    inner.touch(&path);
                    return Ok(cancel);
                }
                inner.lru_path(external)
            };

            let Some(victim_path) = victim_path else {
                // Capacity zero is a misconfiguration; insert anyway rather
                // than refuse service.
                warn!(path = %record.path, "Pool capacity is zero; inserting without eviction");
                let mut inner = self.inner.lock().await;
                let resident = Resident::new(record.clone());
                let cancel = resident.cancel.clone();
                if external {
                    inner.api.remove(&record.path);
                    inner.external.insert(record.path.clone(), resident);
                } else {
                    inner.external.remove(&record.path);
                    inner.api.insert(record.path.clone(), resident);
                }
                inner.touch(&record.path);
                return Ok(cancel);
            };

            // Persist the victim's pending writes before it leaves memory.
            let victim = {
                let inner = self.inner.lock().await;
                inner.get(&victim_path).map(|r| r.record().clone())
            };
            if let Some(victim) = victim {
                if let Err(e) = self.repo.update(&victim).await {
                    warn!(path = %victim_path, error = %e, "Failed to persist evicted session");
                }
            }
            {
                // Eviction is persist-then-cleanup, not abort: the victim's
                // token stays uncancelled, so a turn still in flight for it
                // finishes and persists through `commit` without residency.
                let mut inner = self.inner.lock().await;
                if external {
                    inner.external.remove(&victim_path);
                } else {
                    inner.api.remove(&victim_path);
                }
                inner.access.remove(&victim_path);
            }
            debug!(path = %victim_path, "Evicted LRU resident");
        }
    }

    /// Read a record without promoting it to residency: resident copy first,
    /// then the repository.
    pub async fn load_record(&self, path: &str) -> Result<Option<SessionRecord>> {
        {
            let inner = self.inner.lock().await;
            if let Some(resident) = inner.get(path) {
                return Ok(Some(resident.record().clone()));
            }
        }
        self.repo.find_by_script_path(path).await
    }

    /// Write a record back: refresh the resident copy when there is one,
    /// always persist.
    pub async fn commit(&self, record: &SessionRecord) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(resident) = inner.get_mut(&record.path) {
                *resident.record_mut() = record.clone();
            }
            inner.touch(&record.path);
        }
        self.repo.update(record).await
    }

    /// Resident counts: (api, external). Test and introspection hook.
    pub async fn resident_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.api.len(), inner.external.len())
    }

    // ------------------------------------------------------------------
    // Turn protocol
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        path: &str,
        session_id: &str,
        input: &str,
    ) -> Result<TurnReport> {
        let (mut record, cancel) = self.checkout(path).await?;
        if record.id != session_id {
            return Err(SessionError::IdentityMismatch {
                loaded: record.id,
                requested: session_id.to_string(),
            });
        }
        if record.kind.is_external() {
            return Err(SessionError::InvalidState {
                operation: "send_message",
                status: record.status,
            });
        }
        // An in-flight session must finish its turn or be confirmed first;
        // driving it back to processing would strand its pending calls.
        if record.status.is_in_flight() {
            return Err(SessionError::InvalidState {
                operation: "send_message",
                status: record.status,
            });
        }

        record.status = SessionStatus::Processing;
        record.meta.draft = None;
        self.commit(&record).await?;
        self.notify(&record, ChatUpdateKind::StatusChanged(SessionStatus::Processing))
            .await;

        self.run_turns(record, cancel, TurnInput::user(input)).await
    }

    /// Confirmation is a continuation of the same turn protocol: the last
    /// confirmed call re-enters the loop with the tool result as input.
    pub async fn confirm_tool_call(
        &self,
        path: &str,
        session_id: &str,
        call_id: &str,
        output: serde_json::Value,
    ) -> Result<TurnReport> {
        let (mut record, cancel) = self.checkout(path).await?;
        if record.id != session_id {
            return Err(SessionError::IdentityMismatch {
                loaded: record.id,
                requested: session_id.to_string(),
            });
        }
        if record.status != SessionStatus::WaitingConfirmation {
            return Err(SessionError::InvalidState {
                operation: "confirm_tool_call",
                status: record.status,
            });
        }

        let index = record
            .meta
            .pending_calls
            .iter()
            .position(|c| c.id == call_id)
            .ok_or_else(|| SessionError::NotFound(call_id.to_string()))?;
        let call = record.meta.pending_calls.remove(index);
        let payload = serde_json::json!({
            "tool_call_id": call.id,
            "name": call.name,
            "output": output,
        });

        if !record.meta.pending_calls.is_empty() {
            // Confirmations remain; persist partial state and keep waiting.
            record.push_message(Message::structured(Role::Tool, payload));
            self.commit(&record).await?;
            self.notify(&record, ChatUpdateKind::MessageAdded).await;
            return Ok(TurnReport::WaitingConfirmation);
        }

        record.status = SessionStatus::Processing;
        self.commit(&record).await?;
        self.notify(&record, ChatUpdateKind::StatusChanged(SessionStatus::Processing))
            .await;
        self.run_turns(record, cancel, TurnInput::tool(payload.to_string()))
            .await
    }

    /// One turn: invoke the backend, then keep going while the next-speaker
    /// policy says "agent", persisting after every sub-turn so a crash leaves
    /// state at most one sub-turn stale. The hop budget caps the loop even if
    /// the policy never yields.
    async fn run_turns(
        &self,
        mut record: SessionRecord,
        cancel: CancellationToken,
        first_input: TurnInput,
    ) -> Result<TurnReport> {
        let budget = record
            .meta
            .max_turns
            .saturating_sub(record.meta.turns_used)
            .max(1);
        let mut hops = 0u32;
        let mut input = first_input;

        loop {
            record.push_message(Message::text(input.role, input.text.clone()));

            // History up to but not including the input; backends append the
            // input themselves when building the wire request.
            let history = &record.messages[..record.messages.len() - 1];
            let turn = match self
                .backend
                .send_message(&record.path, &record.id, &input, history)
                .await
            {
                Ok(turn) => turn,
                Err(e) => {
                    warn!(session_id = %record.id, error = %e, "Backend turn failed");
                    record.status = SessionStatus::Error;
                    self.commit(&record).await?;
                    self.notify(&record, ChatUpdateKind::StatusChanged(SessionStatus::Error))
                        .await;
                    return Err(SessionError::Backend(e));
                }
            };

            for message in &turn.messages {
                record.push_message(message.clone());
            }
            record.meta.turns_used += 1;
            hops += 1;

            if !turn.pending_calls.is_empty() {
                record.meta.pending_calls = turn.pending_calls.clone();
                record.status = SessionStatus::WaitingConfirmation;
                self.commit(&record).await?;
                self.notify(
                    &record,
                    ChatUpdateKind::StatusChanged(SessionStatus::WaitingConfirmation),
                )
                .await;
                return Ok(TurnReport::WaitingConfirmation);
            }

            self.commit(&record).await?;
            self.notify(&record, ChatUpdateKind::MessageAdded).await;

            if record.meta.turns_used >= record.meta.max_turns || hops >= budget {
                record.status = SessionStatus::MaxTurnsReached;
                self.commit(&record).await?;
                self.notify(
                    &record,
                    ChatUpdateKind::StatusChanged(SessionStatus::MaxTurnsReached),
                )
                .await;
                return Ok(TurnReport::MaxTurnsReached);
            }

            if cancel.is_cancelled() {
                debug!(session_id = %record.id, "Abort signalled; ending turn loop");
                break;
            }

            match next_speaker(&turn) {
                NextSpeaker::Agent => input = TurnInput::continuation(),
                NextSpeaker::User => break,
            }
        }

        record.status = SessionStatus::Idle;
        self.commit(&record).await?;
        self.notify(&record, ChatUpdateKind::ResponseCompleted).await;
        Ok(TurnReport::Completed)
    }

    /// Advisory, in-memory only. A turn that ignores the signal completes
    /// and persists normally; nothing is rolled back.
    pub async fn abort(&self, path: &str, session_id: &str) {
        let inner = self.inner.lock().await;
        if let Some(resident) = inner.get(path) {
            if resident.record().id == session_id {
                resident.cancel.cancel();
                debug!(session_id = %session_id, "Abort signalled");
            }
        }
    }

    // ------------------------------------------------------------------
    // External sessions
    // ------------------------------------------------------------------

    /// Migrate a resident api session into the external pool in place,
    /// carrying messages and metadata. Idempotent when already external.
    pub async fn convert_to_external(&self, path: &str) -> Result<SessionRecord> {
        let taken = {
            let mut inner = self.inner.lock().await;
            if let Some(resident) = inner.external.get(path) {
                return Ok(resident.record().clone());
            }
            match inner.api.remove(path) {
                Some(resident) => {
                    inner.access.remove(path);
                    resident
                }
                None => return Err(SessionError::NotFound(path.to_string())),
            }
        };

        // Tear down the original backend resources.
        taken.cancel.cancel();

        let mut record = taken.record().clone();
        record.kind = BackendKind::ExternalProcess;
        record.status = SessionStatus::ExternalActive;
        record.touch();

        self.insert_resident(record.clone()).await?;
        self.repo.update(&record).await?;
        self.notify(
            &record,
            ChatUpdateKind::StatusChanged(SessionStatus::ExternalActive),
        )
        .await;
        info!(session_id = %record.id, path = %path, "Converted session to external");
        Ok(record)
    }

    /// Feed one terminal capture to a resident terminal-attached session.
    /// Returns None for a blank snapshot. Captures for a terminated session
    /// are still merged; callers should treat them as informational.
    pub async fn apply_snapshot(
        &self,
        path: &str,
        buffer: &str,
    ) -> Result<Option<MergeOutcome>> {
        let (record, outcome) = {
            let mut inner = self.inner.lock().await;
            let resident = inner
                .external
                .get_mut(path)
                .ok_or_else(|| SessionError::NotFound(path.to_string()))?;
            let outcome = match &mut resident.body {
                ResidentBody::Terminal(pty) => pty.apply_snapshot(buffer),
                _ => {
                    return Err(SessionError::InvalidState {
                        operation: "apply_snapshot",
                        status: resident.record().status,
                    })
                }
            };
            let record = resident.record().clone();
            inner.touch(path);
            (record, outcome)
        };

        let Some(outcome) = outcome else {
            return Ok(None);
        };
        self.repo.update(&record).await?;
        self.notify(&record, ChatUpdateKind::MessageAdded).await;
        Ok(Some(outcome))
    }

    /// The external process behind a session went away.
    pub async fn mark_external_terminated(&self, path: &str) -> Result<()> {
        let record = {
            let mut inner = self.inner.lock().await;
            let resident = inner
                .external
                .get_mut(path)
                .ok_or_else(|| SessionError::NotFound(path.to_string()))?;
            match &mut resident.body {
                ResidentBody::Terminal(pty) => pty.mark_terminated(),
                ResidentBody::External(record) => {
                    record.status = SessionStatus::ExternalTerminated;
                    record.touch();
                }
                ResidentBody::Api(_) => unreachable!("api session in external map"),
            }
            resident.record().clone()
        };
        self.repo.update(&record).await?;
        self.notify(
            &record,
            ChatUpdateKind::StatusChanged(SessionStatus::ExternalTerminated),
        )
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Delete from storage and drop the in-memory reference. Eviction never
    /// calls this; it only leaves memory.
    pub async fn delete_session(&self, path: &str) -> Result<()> {
        let resident_id = {
            let mut inner = self.inner.lock().await;
            let removed = inner
                .api
                .remove(path)
                .or_else(|| inner.external.remove(path));
            inner.access.remove(path);
            removed.map(|r| {
                r.cancel.cancel();
                r.record().id.clone()
            })
        };
        let id = match resident_id {
            Some(id) => id,
            None => self
                .repo
                .find_by_script_path(path)
                .await?
                .map(|r| r.id)
                .ok_or_else(|| SessionError::NotFound(path.to_string()))?,
        };
        self.repo.delete(&id).await?;
        info!(session_id = %id, path = %path, "Deleted session");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    async fn notify(&self, record: &SessionRecord, update: ChatUpdateKind) {
        let event = ChatEvent::ChatUpdated {
            chat_id: record.id.clone(),
            path: record.path.clone(),
            model_id: record.meta.model_id.clone(),
            update,
        };
        if let Err(e) = self.events.emit(event).await {
            warn!(session_id = %record.id, error = %e, "Event handler failed during emit");
        }
    }
}

/// Best-effort script provenance for a backing file that exists on disk.
async fn load_provenance(path: &str) -> Option<ScriptProvenance> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let modified_at = tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Some(ScriptProvenance {
        path: path.to_string(),
        content_hash: script_hash(&content),
        modified_at,
        snapshot: Some(content),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_check() {
        let config = PoolConfig {
            project_roots: vec![PathBuf::from("/projects")],
            ..Default::default()
        };
        let pool = SessionPool::new(
            Arc::new(crate::store::MemoryRepository::new()),
            Arc::new(NullBackend),
            EventBus::new(),
            config,
        );
        assert!(pool.check_scope("/projects/app/chat.md").is_ok());
        assert!(matches!(
            pool.check_scope("/elsewhere/chat.md"),
            Err(SessionError::OutOfScope(_))
        ));
    }

    #[test]
    fn test_scope_disabled_when_no_roots() {
        let pool = SessionPool::new(
            Arc::new(crate::store::MemoryRepository::new()),
            Arc::new(NullBackend),
            EventBus::new(),
            PoolConfig::default(),
        );
        assert!(pool.check_scope("/anywhere/at/all.md").is_ok());
    }

    #[test]
    fn test_lru_pick_is_oldest_tick() {
        let mut inner = PoolInner::default();
        for path in ["/a", "/b", "/c"] {
            inner
                .api
                .insert(path.to_string(), Resident::new(SessionRecord::new(path, BackendKind::Api)));
            inner.touch(path);
        }
        inner.touch("/a");
        assert_eq!(inner.lru_path(false), Some("/b".to_string()));
    }

    struct NullBackend;

    #[async_trait::async_trait]
    impl ChatBackend for NullBackend {
        async fn send_message(
            &self,
            _path: &str,
            _session_id: &str,
            _input: &TurnInput,
            _history: &[Message],
        ) -> anyhow::Result<crate::backend::TurnResult> {
            Ok(crate::backend::TurnResult::default())
        }

        fn name(&self) -> &'static str {
            "null"
        }
    }
}
