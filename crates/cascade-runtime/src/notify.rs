use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use cascade_core::error::Result;

/// Boxed future returned by notification operations.
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Optional sink for instance lifecycle notifications.
///
/// Delivery transports live outside the core; the driver only reports the
/// moments worth telling someone about.
pub trait SignalNotificationService: Send + Sync {
    /// An instance suspended and is waiting for a signal.
    fn notify_approval_requested<'a>(
        &'a self,
        instance_id: Uuid,
        workflow_id: &'a str,
        signal: &'a str,
    ) -> NotifyFuture<'a>;

    /// An instance completed successfully.
    fn notify_completed<'a>(&'a self, instance_id: Uuid, workflow_id: &'a str) -> NotifyFuture<'a>;

    /// An instance failed.
    fn notify_errored<'a>(
        &'a self,
        instance_id: Uuid,
        workflow_id: &'a str,
        error: &'a str,
    ) -> NotifyFuture<'a>;
}

/// Notification sink that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

impl SignalNotificationService for NoOpNotifier {
    fn notify_approval_requested<'a>(
        &'a self,
        _instance_id: Uuid,
        _workflow_id: &'a str,
        _signal: &'a str,
    ) -> NotifyFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn notify_completed<'a>(
        &'a self,
        _instance_id: Uuid,
        _workflow_id: &'a str,
    ) -> NotifyFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn notify_errored<'a>(
        &'a self,
        _instance_id: Uuid,
        _workflow_id: &'a str,
        _error: &'a str,
    ) -> NotifyFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_notifier_accepts_everything() {
        let notifier = NoOpNotifier;
        let id = Uuid::new_v4();
        notifier
            .notify_approval_requested(id, "wf.test", "approval")
            .await
            .unwrap();
        notifier.notify_completed(id, "wf.test").await.unwrap();
        notifier.notify_errored(id, "wf.test", "boom").await.unwrap();
    }
}
