//! Event handler trait and adapters.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::EventError;
use crate::event::Event;

/// Trait for event subscribers.
///
/// A handler that returns an error is logged and counted by the bus; the
/// error never reaches the publisher and never prevents delivery to other
/// handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns an identifier for this handler, used in logs.
    fn id(&self) -> &str {
        "anonymous"
    }

    /// Handles an event.
    async fn handle(&self, event: &Event) -> Result<(), EventError>;
}

/// A shared event handler.
pub type SharedHandler = Arc<dyn EventHandler>;

/// Wrapper for closure-based handlers.
pub struct FnHandler<F> {
    id: String,
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send + 'static,
{
    /// Creates a new closure handler.
    pub fn new(id: impl Into<String>, handler: F) -> Self {
        Self {
            id: id.into(),
            handler,
        }
    }

    /// Creates a new closure handler behind an `Arc`.
    pub fn shared(id: impl Into<String>, handler: F) -> SharedHandler
    where
        F: 'static,
    {
        Arc::new(Self::new(id, handler))
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        (self.handler)(event.clone()).await
    }
}

/// Runs a handler, logging instead of propagating its failure.
///
/// Returns `true` when the handler succeeded.
pub(crate) async fn dispatch(handler: &dyn EventHandler, event: &Event) -> bool {
    match handler.handle(event).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                handler = handler.id(),
                event_type = %event.event_type,
                operation_id = %event.operation_id,
                "Event handler error: {}",
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_fn_handler_receives_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = FnHandler::new("collector", move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(event.operation_id);
                Ok(())
            }
        });

        assert_eq!(handler.id(), "collector");
        let event = Event::new(EventType::DeploymentStarted, "dep-1");
        assert!(dispatch(&handler, &event).await);
        assert_eq!(*seen.lock().await, vec!["dep-1".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_errors() {
        let handler = FnHandler::new("broken", |_event: Event| async {
            Err(EventError::HandlerFailed("boom".into()))
        });
        let event = Event::new(EventType::DeploymentStarted, "dep-1");
        assert!(!dispatch(&handler, &event).await);
    }
}
