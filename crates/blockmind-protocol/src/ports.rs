//! Collaborator ports.
//!
//! These traits are the only boundary between the core and the code that
//! reacts to it: event listeners registered on the bus and mode handlers
//! registered with the state machine.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Callbacks report failure through `BoxError`; the core isolates and
//!   counts failures, it never propagates them to producers.

use crate::error::BoxError;
use crate::event::GameEvent;
use crate::ids::ModeName;
use crate::mode::ModeTransitionRequest;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A callback subscribed to one or all event kinds.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: Arc<GameEvent>) -> Result<(), BoxError>;

    /// Short name used in logs and listener diagnostics.
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Closure adapter for [`EventListener`]. Build with [`listener_fn`].
pub struct FnListener<F> {
    label: String,
    f: F,
}

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Wrap an async closure as a listener.
///
/// ```ignore
/// let listener = listener_fn("log-chat", |event| async move {
///     tracing::info!(line = %event.describe());
///     Ok(())
/// });
/// ```
pub fn listener_fn<F, Fut>(label: impl Into<String>, f: F) -> FnListener<F>
where
    F: Fn(Arc<GameEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    FnListener {
        label: label.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(Arc<GameEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn on_event(&self, event: Arc<GameEvent>) -> Result<(), BoxError> {
        (self.f)(event).await
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Entry/exit logic and transition proposals for one mode.
#[async_trait]
pub trait ModeHandler: Send + Sync {
    fn mode_name(&self) -> ModeName;

    async fn on_enter(&self, reason: &str, triggered_by: &str) -> Result<(), BoxError>;

    async fn on_exit(&self, reason: &str, triggered_by: &str) -> Result<(), BoxError>;

    fn can_enter(&self) -> bool {
        true
    }

    /// Whether this mode yields to a lower-priority request. Handlers that do
    /// not override this keep the plain priority rule.
    fn can_exit(&self) -> bool {
        false
    }

    fn status(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn check_transitions(&self) -> Vec<ModeTransitionRequest> {
        Vec::new()
    }
}

/// Source of the transition epoch: a counter that advances on every
/// committed mode transition. The bus samples it when a dispatch begins.
pub trait EpochSource: Send + Sync {
    fn current_epoch(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn listener_fn_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let listener = listener_fn("counter", move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_eq!(listener.label(), "counter");

        let event = Arc::new(GameEvent::new(EventKind::Rain));
        listener.on_event(event.clone()).await.unwrap();
        listener.on_event(event).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listener_fn_surfaces_errors() {
        let listener = listener_fn("failing", |_event| async move {
            Err::<(), BoxError>("boom".into())
        });
        let err = listener
            .on_event(Arc::new(GameEvent::new(EventKind::Death)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    struct Idle;

    #[async_trait]
    impl ModeHandler for Idle {
        fn mode_name(&self) -> ModeName {
            ModeName::from_string("idle")
        }

        async fn on_enter(&self, _reason: &str, _by: &str) -> Result<(), BoxError> {
            Ok(())
        }

        async fn on_exit(&self, _reason: &str, _by: &str) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mode_handler_defaults() {
        let handler: Arc<dyn ModeHandler> = Arc::new(Idle);
        assert!(handler.can_enter());
        assert!(!handler.can_exit());
        assert!(handler.status().is_null());
        assert!(handler.check_transitions().await.is_empty());
    }
}
