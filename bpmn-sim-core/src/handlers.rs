//! Element Handler Registry
//!
//! Embedders can intercept specific element kinds before default routing
//! runs. A handler returns `Some(successors)` to replace normal routing or
//! `None` to fall through. The built-in [`WaitHandler`] models elements a
//! token should linger at (user tasks, timers): it parks the token, pauses
//! the scheduler, and re-arms it after a configurable delay. The token is
//! marked to bypass the handler on the immediately following visit so the
//! wait cannot re-trigger itself.

use crate::graph::ElementKind;
use crate::sim::SimHandle;
use crate::token::Token;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// Per-element-kind interceptor invoked before default routing.
#[async_trait]
pub trait ElementHandler: Send + Sync {
    /// `Some(tokens)` short-circuits routing; `None` falls through.
    async fn on_enter(&self, token: &Token, api: &HandlerApi) -> Option<Vec<Token>>;
}

/// Capabilities handed to a handler invocation.
///
/// `pause` is an intent applied once the handler returns. Handlers run
/// while the engine holds its state lock, so they never mutate scheduler
/// state directly; asynchronous resumption goes through [`SimHandle`],
/// which acquires the lock fresh.
pub struct HandlerApi {
    handle: SimHandle,
    pause_requested: AtomicBool,
    cleanups: Mutex<Vec<AbortHandle>>,
}

impl HandlerApi {
    pub(crate) fn new(handle: SimHandle) -> Self {
        Self {
            handle,
            pause_requested: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    /// Request the scheduler be paused when this handler returns.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Handle for resuming the simulation later, from outside the step.
    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    /// Register an abortable task to be cancelled on `pause`/`stop`.
    pub fn add_cleanup(&self, handle: AbortHandle) {
        self.cleanups.lock().expect("cleanup list poisoned").push(handle);
    }

    pub(crate) fn into_effects(self) -> (bool, Vec<AbortHandle>) {
        let pause = self.pause_requested.load(Ordering::SeqCst);
        let cleanups = self.cleanups.into_inner().expect("cleanup list poisoned");
        (pause, cleanups)
    }
}

/// Typed dispatch table from element kind to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ElementKind, Arc<dyn ElementHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with wait behavior for the element kinds a token
    /// should linger at.
    pub fn with_builtin_waits(wait_delay: Duration) -> Self {
        let mut registry = Self::new();
        let wait: Arc<dyn ElementHandler> = Arc::new(WaitHandler::new(wait_delay));
        for kind in [
            ElementKind::UserTask,
            ElementKind::ManualTask,
            ElementKind::TimerEvent,
        ] {
            registry.register(kind, wait.clone());
        }
        registry
    }

    pub fn register(&mut self, kind: ElementKind, handler: Arc<dyn ElementHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &ElementKind) -> Option<Arc<dyn ElementHandler>> {
        self.handlers.get(kind).cloned()
    }
}

/// Built-in handler: hold the token in place for `delay`, then resume.
pub struct WaitHandler {
    delay: Duration,
}

impl WaitHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ElementHandler for WaitHandler {
    async fn on_enter(&self, token: &Token, api: &HandlerApi) -> Option<Vec<Token>> {
        let element = token.element_id().unwrap_or("<none>").to_string();
        debug!(token = token.id, %element, "waiting at element");

        api.pause();
        let handle = api.handle();
        let token_id = token.id;
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.resume_skipping(token_id).await;
        });
        api.add_cleanup(timer.abort_handle());

        // The token stays put; routing resumes on the skip visit.
        Some(vec![token.clone()])
    }
}
