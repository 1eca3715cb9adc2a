use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use blockmind_protocol::{ModeHandler, ModeName};
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

/// Result of running one enter/exit callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Completed,
    NoHandler,
    Failed { error: String },
}

impl CallbackOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Enter,
    Exit,
}

/// Ordered mode → handler table. Registration order is the order in which
/// handlers are asked for transition proposals.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<IndexMap<ModeName, Arc<dyn ModeHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own mode name, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn ModeHandler>) -> Option<Arc<dyn ModeHandler>> {
        let mode = handler.mode_name();
        let previous = self.handlers.write().insert(mode.clone(), handler);
        if previous.is_some() {
            warn!(%mode, "mode handler replaced");
        } else {
            info!(%mode, "mode handler registered");
        }
        previous
    }

    pub fn unregister(&self, mode: &ModeName) -> Option<Arc<dyn ModeHandler>> {
        let removed = self.handlers.write().shift_remove(mode);
        if removed.is_some() {
            info!(%mode, "mode handler unregistered");
        }
        removed
    }

    pub fn get(&self, mode: &ModeName) -> Option<Arc<dyn ModeHandler>> {
        self.handlers.read().get(mode).cloned()
    }

    pub fn contains(&self, mode: &ModeName) -> bool {
        self.handlers.read().contains_key(mode)
    }

    pub fn all(&self) -> Vec<(ModeName, Arc<dyn ModeHandler>)> {
        self.handlers
            .read()
            .iter()
            .map(|(name, handler)| (name.clone(), handler.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub async fn call_enter(&self, mode: &ModeName, reason: &str, by: &str) -> CallbackOutcome {
        self.call(Phase::Enter, mode, reason, by).await
    }

    pub async fn call_exit(&self, mode: &ModeName, reason: &str, by: &str) -> CallbackOutcome {
        self.call(Phase::Exit, mode, reason, by).await
    }

    async fn call(&self, phase: Phase, mode: &ModeName, reason: &str, by: &str) -> CallbackOutcome {
        let Some(handler) = self.get(mode) else {
            return CallbackOutcome::NoHandler;
        };
        let result = match phase {
            Phase::Enter => AssertUnwindSafe(handler.on_enter(reason, by)).catch_unwind().await,
            Phase::Exit => AssertUnwindSafe(handler.on_exit(reason, by)).catch_unwind().await,
        };
        let failure = match result {
            Ok(Ok(())) => return CallbackOutcome::Completed,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "handler panicked".to_owned(),
        };
        error!(%mode, ?phase, error = %failure, "mode handler callback failed");
        CallbackOutcome::Failed { error: failure }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("modes", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
