//! Per-model dispatch queue
//!
//! One FIFO queue per model id and a busy-model set, owned by a single
//! manager instance. Dispatch is serialized per model id and released
//! through ChatUpdated events rather than polling. Stale queue entries
//! (deleted files, replaced sessions, missing drafts) self-heal via
//! verify-drop-recurse and never surface to callers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{ExistenceProbe, ExternalChatRunner};
use crate::error::{Result, SessionError};
use crate::events::{ChatEvent, ChatUpdateKind, EventBus, EventKind, Subscription};
use crate::session::pool::SessionPool;
use crate::session::SessionStatus;
use crate::store::SessionRepository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub chat_id: String,
    pub path: String,
    pub model_id: String,
}

#[derive(Default)]
struct QueueInner {
    queues: HashMap<String, VecDeque<QueueItem>>,
    busy: HashSet<String>,
}

impl QueueInner {
    fn contains_path(&self, path: &str) -> bool {
        self.queues
            .values()
            .any(|q| q.iter().any(|item| item.path == path))
    }
}

pub struct QueueManager {
    pool: Arc<SessionPool>,
    repo: Arc<dyn SessionRepository>,
    events: EventBus,
    probe: Arc<dyn ExistenceProbe>,
    external: Option<Arc<dyn ExternalChatRunner>>,
    /// Model ids whose backend is a CLI process behind a pseudo-terminal
    terminal_models: HashSet<String>,
    inner: Mutex<QueueInner>,
    subscription: Mutex<Option<Subscription>>,
}

impl QueueManager {
    pub fn new(
        pool: Arc<SessionPool>,
        repo: Arc<dyn SessionRepository>,
        events: EventBus,
        probe: Arc<dyn ExistenceProbe>,
        external: Option<Arc<dyn ExternalChatRunner>>,
        terminal_models: impl IntoIterator<Item = String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            repo,
            events,
            probe,
            external,
            terminal_models: terminal_models.into_iter().collect(),
            inner: Mutex::new(QueueInner::default()),
            subscription: Mutex::new(None),
        })
    }

    /// Subscribe to ChatUpdated so completed responses pull the next item.
    pub async fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscription = self
            .events
            .subscribe(EventKind::ChatUpdated, move |event| {
                let weak = weak.clone();
                let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_chat_updated(event).await;
                    }
                    Ok(())
                });
                fut
            })
            .await;
        *self.subscription.lock().await = Some(subscription);
    }

    pub async fn shutdown(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.unsubscribe().await;
        }
        let mut inner = self.inner.lock().await;
        inner.queues.clear();
        inner.busy.clear();
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Mark the chat scheduled and enqueue it for its model. An in-flight
    /// chat is rejected with `InvalidState`. A chat without a model id is
    /// marked error and left for manual correction; it is never enqueued and
    /// never retried silently.
    pub async fn schedule(self: &Arc<Self>, chat_id: &str, path: &str) -> Result<()> {
        let mut record = self
            .pool
            .load_record(path)
            .await?
            .ok_or_else(|| SessionError::NotFound(path.to_string()))?;

        // Scheduling over an in-flight chat would re-dispatch it mid-turn and
        // stamp out its waiting-confirmation state.
        if record.status.is_in_flight() {
            return Err(SessionError::InvalidState {
                operation: "schedule",
                status: record.status,
            });
        }

        let Some(model_id) = record.meta.model_id.clone() else {
            warn!(chat_id = %chat_id, path = %path, "Schedule request without model id");
            record.status = SessionStatus::Error;
            record.touch();
            self.pool.commit(&record).await?;
            return Ok(());
        };

        record.status = SessionStatus::Scheduled;
        record.touch();
        self.pool.commit(&record).await?;

        {
            let mut inner = self.inner.lock().await;
            // At most one queue item per resource path.
            if !inner.contains_path(path) {
                inner.queues.entry(model_id.clone()).or_default().push_back(QueueItem {
                    chat_id: chat_id.to_string(),
                    path: path.to_string(),
                    model_id: model_id.clone(),
                });
            }
        }
        debug!(chat_id = %chat_id, model = %model_id, "Scheduled chat");

        self.try_run_next(Some(&model_id)).await;
        Ok(())
    }

    /// Pop and dispatch the head item for a model, verifying each item is
    /// still sane. One in-flight turn per model id, globally.
    pub async fn try_run_next(self: &Arc<Self>, model_id: Option<&str>) {
        let Some(model_id) = model_id else {
            debug!("try_run_next called without a model id");
            return;
        };

        loop {
            // Reserve the model in the same critical section as the pop so
            // two concurrent callers can never double-dispatch one model.
            let item = {
                let mut inner = self.inner.lock().await;
                if inner.busy.contains(model_id) {
                    return;
                }
                match inner.queues.get_mut(model_id).and_then(VecDeque::pop_front) {
                    Some(item) => {
                        inner.busy.insert(model_id.to_string());
                        item
                    }
                    None => return,
                }
            };

            // The backing file may have been deleted since scheduling.
            if !self.probe.exists(&item.path) {
                debug!(path = %item.path, "Dropping queue item for missing file");
                self.inner.lock().await.busy.remove(model_id);
                continue;
            }

            // The file may have been replaced by a different session.
            let record = match self.pool.load_record(&item.path).await {
                Ok(Some(record)) => Some(record),
                Ok(None) => {
                    debug!(path = %item.path, "Dropping queue item for vanished session");
                    None
                }
                Err(e) => {
                    warn!(path = %item.path, error = %e, "Dropping queue item after load failure");
                    None
                }
            };
            let Some(record) = record else {
                self.inner.lock().await.busy.remove(model_id);
                continue;
            };
            if record.id != item.chat_id {
                debug!(path = %item.path, "Dropping queue item after id mismatch");
                self.inner.lock().await.busy.remove(model_id);
                continue;
            }

            let Some(draft) = record.meta.draft.clone().filter(|d| !d.trim().is_empty()) else {
                debug!(chat_id = %item.chat_id, "No draft prompt; freeing model and dropping item");
                self.inner.lock().await.busy.remove(model_id);
                continue;
            };

            self.dispatch(item, draft);
            return;
        }
    }

    /// Fire the turn without awaiting it; release always arrives through the
    /// event bus. A dispatch failure frees the model and retries the queue
    /// instead of propagating.
    fn dispatch(self: &Arc<Self>, item: QueueItem, draft: String) {
        let manager = Arc::clone(self);
        let terminal_class = self.terminal_models.contains(&item.model_id);
        info!(chat_id = %item.chat_id, model = %item.model_id, terminal_class, "Dispatching turn");

        tokio::spawn(async move {
            let outcome: anyhow::Result<()> = if terminal_class {
                match &manager.external {
                    Some(runner) => runner.send_message(&item.path, &item.chat_id, &draft).await,
                    None => Err(anyhow::anyhow!("no external chat runner configured")),
                }
            } else {
                manager
                    .pool
                    .send_message(&item.path, &item.chat_id, &draft)
                    .await
                    .map(|_| ())
                    .map_err(Into::into)
            };

            if let Err(e) = outcome {
                warn!(chat_id = %item.chat_id, model = %item.model_id, error = %e,
                    "Dispatch failed; freeing model and retrying queue");
                manager.inner.lock().await.busy.remove(&item.model_id);
                manager.try_run_next(Some(&item.model_id)).await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Event-driven release
    // ------------------------------------------------------------------

    async fn on_chat_updated(self: &Arc<Self>, event: ChatEvent) {
        let ChatEvent::ChatUpdated {
            path,
            model_id,
            update,
            ..
        } = event;

        let released = match update {
            ChatUpdateKind::ResponseCompleted => true,
            ChatUpdateKind::StatusChanged(status) => !status.is_in_flight(),
            ChatUpdateKind::MessageAdded => false,
        };
        if !released {
            return;
        }
        let Some(model_id) = model_id else {
            return;
        };

        {
            let mut inner = self.inner.lock().await;
            inner.busy.remove(&model_id);
            if let Some(queue) = inner.queues.get_mut(&model_id) {
                queue.retain(|item| item.path != path);
            }
        }
        self.try_run_next(Some(&model_id)).await;
    }

    // ------------------------------------------------------------------
    // Watcher reconciliation
    // ------------------------------------------------------------------

    /// The backing resource was deleted externally.
    pub async fn on_resource_removed(&self, path: &str) {
        let mut inner = self.inner.lock().await;
        for queue in inner.queues.values_mut() {
            queue.retain(|item| item.path != path);
        }
    }

    /// A resource appeared whose persisted status is still "scheduled":
    /// a crash orphaned it before dispatch. Re-enter schedule.
    pub async fn on_resource_discovered(self: &Arc<Self>, path: &str) {
        match self.repo.find_by_script_path(path).await {
            Ok(Some(record)) if record.status == SessionStatus::Scheduled => {
                info!(chat_id = %record.id, path = %path, "Recovering orphaned scheduled chat");
                if let Err(e) = self.schedule(&record.id, path).await {
                    warn!(path = %path, error = %e, "Failed to recover scheduled chat");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path, error = %e, "Discovery lookup failed"),
        }
    }

    /// Paths persisted as "scheduled"; startup recovery feeds these back
    /// through `on_resource_discovered`.
    pub async fn scheduled_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == SessionStatus::Scheduled)
            .map(|r| r.path)
            .collect())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn is_busy(&self, model_id: &str) -> bool {
        self.inner.lock().await.busy.contains(model_id)
    }

    pub async fn queue_depth(&self, model_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(model_id)
            .map_or(0, VecDeque::len)
    }
}
