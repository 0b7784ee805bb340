//! In-process event bus
//!
//! Ordered pub/sub used to serialize the queue manager's release protocol:
//! `emit` resolves only after every handler subscribed for the event kind has
//! run, in subscription order. A failing handler is not isolated from the
//! emit call; the error surfaces to the emitter.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::session::SessionStatus;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatUpdated,
}

/// What changed about a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatUpdateKind {
    MessageAdded,
    ResponseCompleted,
    StatusChanged(SessionStatus),
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ChatUpdated {
        chat_id: String,
        path: String,
        model_id: Option<String>,
        update: ChatUpdateKind,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ChatUpdated { .. } => EventKind::ChatUpdated,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

type Handler = Arc<dyn Fn(ChatEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Dropping the returned guard
    /// does nothing; call `unsubscribe` to detach.
    pub async fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(ChatEvent) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: self.clone(),
            kind,
            id,
        }
    }

    /// Run every handler for the event's kind, in subscription order.
    pub async fn emit(&self, event: ChatEvent) -> Result<()> {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().await;
            inner
                .handlers
                .get(&event.kind())
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event.clone()).await?;
        }
        Ok(())
    }
}

pub struct Subscription {
    bus: EventBus,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub async fn unsubscribe(self) {
        let mut inner = self.bus.inner.lock().await;
        if let Some(handlers) = inner.handlers.get_mut(&self.kind) {
            handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> ChatEvent {
        ChatEvent::ChatUpdated {
            chat_id: "c1".into(),
            path: "/tmp/c1.md".into(),
            model_id: None,
            update: ChatUpdateKind::MessageAdded,
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(EventKind::ChatUpdated, move |_| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().await.push(tag);
                    Ok(())
                }) as BoxFuture<'static, Result<()>>
            })
            .await;
        }

        bus.emit(event()).await.unwrap();
        assert_eq!(*order.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_handler_error_reaches_emitter() {
        let bus = EventBus::new();
        bus.subscribe(EventKind::ChatUpdated, |_| {
            Box::pin(async { Err(anyhow::anyhow!("handler failed")) })
                as BoxFuture<'static, Result<()>>
        })
        .await;

        assert!(bus.emit(event()).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        let sub = bus
            .subscribe(EventKind::ChatUpdated, move |_| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as BoxFuture<'static, Result<()>>
            })
            .await;

        bus.emit(event()).await.unwrap();
        sub.unsubscribe().await;
        bus.emit(event()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
