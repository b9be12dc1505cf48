use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct Notification {
    pub task: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// User-notification transport, out of scope for its wire format
/// (spec.md §1) — specified only at this interface.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Collects notifications in memory; used by tests to assert a
/// notification was raised with the expected classified reason.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

/// No-op transport for deployments with no configured notification sink.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _notification: Notification) -> anyhow::Result<()> {
        Ok(())
    }
}
