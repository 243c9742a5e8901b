use std::path::Path;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::Notification;
use crate::sync::status::{StatusReconciler, SyncStatus, SyncSummary};

/// Display state kept on the presentation side. It only ever learns about
/// the service through notifications.
#[derive(Debug, Default)]
pub struct Presenter {
    reconciler: StatusReconciler,
    last_error: Option<String>,
    project_id: Option<String>,
}

impl Presenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one notification into the display state. Returns the summary
    /// when it differs from the one before.
    pub fn apply(&mut self, notification: &Notification) -> Option<SyncSummary> {
        let before = self.summary();
        match notification {
            Notification::SyncStatusUpdate { path, status } => {
                for (dir, aggregated) in self.reconciler.update(path, *status) {
                    debug!(path = %dir.display(), status = ?aggregated, "folder status");
                }
            }
            Notification::WatcherReady => self.reconciler.set_watching(true),
            Notification::SyncStopped => {
                self.reconciler.clear();
                self.reconciler.set_watching(false);
            }
            Notification::SyncError { message } => {
                warn!(%message, "sync error");
                self.last_error = Some(message.clone());
            }
            Notification::ProjectChanged { project_id } => {
                self.reconciler.clear();
                self.project_id = Some(project_id.clone());
            }
            Notification::FileChange { kind, path } => {
                debug!(?kind, path = %path.display(), "file change");
            }
        }
        let after = self.summary();
        (after != before).then_some(after)
    }

    pub fn summary(&self) -> SyncSummary {
        self.reconciler.summary()
    }

    pub fn status_of(&self, path: &Path) -> Option<SyncStatus> {
        self.reconciler.status_of(path)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Consumes notifications until the service goes away, reporting every
    /// summary change.
    pub async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        mut on_summary: impl FnMut(&SyncSummary) + Send,
    ) -> Self {
        while let Some(notification) = notifications.recv().await {
            if let Some(summary) = self.apply(&notification) {
                on_summary(&summary);
            }
        }
        self
    }
}
