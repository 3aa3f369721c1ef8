//! Event routing and background tasks
//!
//! Post-completion work (previews, blob materialization, analytics inserts)
//! runs off the request path. Each event type fans out to its registered
//! handlers on spawned tasks tracked by a `TaskTracker`; enqueue failures are
//! retried once and then logged, never surfaced to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::domain::agent::AgentInput;
use crate::domain::completion::AgentCompletion;
use crate::domain::version::Version;
use crate::runner::CacheUsage;

/// A completion scheduled by the experiment orchestrator
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub experiment_id: String,
    pub completion_id: Uuid,
    pub agent_id: String,
    pub version: Version,
    pub input: AgentInput,
    pub use_cache: CacheUsage,
}

#[derive(Clone, Debug)]
pub enum Event {
    StoreCompletion(Box<AgentCompletion>),
    UserConnected { user_id: String },
    CompletionRequest(Box<CompletionRequest>),
}

/// Discriminant used as the dispatch key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    StoreCompletion,
    UserConnected,
    CompletionRequest,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StoreCompletion(_) => EventKind::StoreCompletion,
            Event::UserConnected { .. } => EventKind::UserConnected,
            Event::CompletionRequest(_) => EventKind::CompletionRequest,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, tenant_uid: i64, event: Event) -> anyhow::Result<()>;
}

/// Process-wide dispatch table. Registration happens once at startup; the
/// task set drops handles as tasks finish.
pub struct SystemEventRouter {
    handlers: parking_lot::RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    tasks: TaskTracker,
}

impl Default for SystemEventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemEventRouter {
    pub fn new() -> Self {
        Self {
            handlers: parking_lot::RwLock::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Schedule every handler for the event. A missing handler is a wiring
    /// bug worth logging, not an error for the caller.
    pub fn route(&self, tenant_uid: i64, event: Event, delay: Option<Duration>) {
        let handlers = {
            let table = self.handlers.read();
            match table.get(&event.kind()) {
                Some(handlers) => handlers.clone(),
                None => {
                    tracing::error!(kind = ?event.kind(), "missing event handler");
                    return;
                }
            }
        };
        for handler in &handlers {
            let handler = handler.clone();
            let event = event.clone();
            self.tasks.spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Err(first) = handler.handle(tenant_uid, event.clone()).await {
                    tracing::warn!(
                        handler = handler.name(),
                        "event handler failed, retrying: {first:#}"
                    );
                    if let Err(second) = handler.handle(tenant_uid, event).await {
                        tracing::error!(
                            handler = handler.name(),
                            "event handler failed twice, dropping event: {second:#}"
                        );
                    }
                }
            });
        }
    }

    /// Wait for in-flight background tasks, used on shutdown
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Per-request router stamping the tenant onto every event
#[derive(Clone)]
pub struct TenantEventRouter {
    tenant_uid: i64,
    system: Arc<SystemEventRouter>,
}

impl TenantEventRouter {
    pub fn new(tenant_uid: i64, system: Arc<SystemEventRouter>) -> Self {
        Self { tenant_uid, system }
    }

    pub fn tenant_uid(&self) -> i64 {
        self.tenant_uid
    }

    pub fn route(&self, event: Event, delay: Option<Duration>) {
        self.system.route(self.tenant_uid, event, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_first: bool,
        seen_tenants: Arc<parking_lot::Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, tenant_uid: i64, _event: Event) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_tenants.lock().push(tenant_uid);
            if self.fail_first && call == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    fn user_event() -> Event {
        Event::UserConnected {
            user_id: "user_1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_route_dispatches_and_stamps_tenant() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tenants = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let router = SystemEventRouter::new();
        router.register(
            EventKind::UserConnected,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first: false,
                seen_tenants: tenants.clone(),
            }),
        );
        let router = Arc::new(router);

        TenantEventRouter::new(42, router.clone()).route(user_event(), None);
        router.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*tenants.lock(), vec![42]);
    }

    #[tokio::test]
    async fn test_failed_handler_retries_once_then_swallows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = SystemEventRouter::new();
        router.register(
            EventKind::UserConnected,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first: true,
                seen_tenants: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }),
        );
        let router = Arc::new(router);

        router.route(1, user_event(), None);
        router.drain().await;
        // First attempt fails, the retry succeeds; the caller never saw it
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_handler_is_swallowed() {
        let router = Arc::new(SystemEventRouter::new());
        router.route(1, user_event(), None);
        router.drain().await;
    }

    #[tokio::test]
    async fn test_multiple_handlers_all_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = SystemEventRouter::new();
        for _ in 0..3 {
            router.register(
                EventKind::UserConnected,
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail_first: false,
                    seen_tenants: Arc::new(parking_lot::Mutex::new(Vec::new())),
                }),
            );
        }
        let router = Arc::new(router);
        router.route(1, user_event(), None);
        router.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
