//! Resource change notifications.

use async_trait::async_trait;

use crate::error::ResourceResult;

/// Receives resource change notifications.
///
/// Calls are best-effort: they run on spawned tasks, and a failure is
/// logged without affecting the manager.
#[async_trait]
pub trait ResourceNotifier: Send + Sync {
    /// A subscribed resource changed.
    async fn resource_updated(&self, uri: &str) -> ResourceResult<()>;

    /// A resource was created or removed.
    async fn resource_list_changed(&self) -> ResourceResult<()>;
}

/// Notifier that discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl ResourceNotifier for NoopNotifier {
    async fn resource_updated(&self, _uri: &str) -> ResourceResult<()> {
        Ok(())
    }

    async fn resource_list_changed(&self) -> ResourceResult<()> {
        Ok(())
    }
}
