use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use projmirror_core::{ApiError, Project, ProjectClient, RemoteFile};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::paths::{PathError, canonical_name};
use super::queue::{SyncTask, TaskKind, TaskProcessor};
use super::status::SyncStatus;
use crate::protocol::{FileChangeKind, Notification};

const MAX_ATTEMPTS: u32 = 3;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote error: {0}")]
    Api(#[from] ApiError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Remote operations the engine reconciles against.
pub trait RemoteSync: Send + Sync + 'static {
    fn list_projects(
        &self,
        organization_id: &str,
    ) -> impl Future<Output = Result<Vec<Project>, ApiError>> + Send;

    fn list_files(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteFile>, ApiError>> + Send;

    fn upload(
        &self,
        organization_id: &str,
        project_id: &str,
        file_name: &str,
        content: &str,
    ) -> impl Future<Output = Result<RemoteFile, ApiError>> + Send;

    fn delete(
        &self,
        organization_id: &str,
        project_id: &str,
        file_id: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl RemoteSync for ProjectClient {
    async fn list_projects(&self, organization_id: &str) -> Result<Vec<Project>, ApiError> {
        ProjectClient::list_projects(self, organization_id).await
    }

    async fn list_files(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> Result<Vec<RemoteFile>, ApiError> {
        self.list_project_files(organization_id, project_id).await
    }

    async fn upload(
        &self,
        organization_id: &str,
        project_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<RemoteFile, ApiError> {
        self.upload_file(organization_id, project_id, file_name, content)
            .await
    }

    async fn delete(
        &self,
        organization_id: &str,
        project_id: &str,
        file_id: &str,
    ) -> Result<(), ApiError> {
        self.delete_file(organization_id, project_id, file_id).await
    }
}

impl<T: RemoteSync> RemoteSync for Arc<T> {
    fn list_projects(
        &self,
        organization_id: &str,
    ) -> impl Future<Output = Result<Vec<Project>, ApiError>> + Send {
        (**self).list_projects(organization_id)
    }

    fn list_files(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteFile>, ApiError>> + Send {
        (**self).list_files(organization_id, project_id)
    }

    fn upload(
        &self,
        organization_id: &str,
        project_id: &str,
        file_name: &str,
        content: &str,
    ) -> impl Future<Output = Result<RemoteFile, ApiError>> + Send {
        (**self).upload(organization_id, project_id, file_name, content)
    }

    fn delete(
        &self,
        organization_id: &str,
        project_id: &str,
        file_id: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        (**self).delete(organization_id, project_id, file_id)
    }
}

/// Applies queued tasks to the remote project with full-replace semantics.
pub struct SyncEngine<R> {
    remote: R,
    events: mpsc::UnboundedSender<Notification>,
    backoff: Backoff,
}

impl<R: RemoteSync> SyncEngine<R> {
    pub fn new(remote: R, events: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            remote,
            events,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    async fn apply(&self, task: &SyncTask) -> Result<(), SyncError> {
        let name = canonical_name(&task.sync_root, &task.file_path)?;
        let org = task.organization_id.as_str();
        let project = task.project_id.as_str();

        // A failed read must leave the remote copy alone.
        let content = match task.kind {
            TaskKind::Add | TaskKind::Change => {
                let bytes = tokio::fs::read(&task.file_path)
                    .await
                    .map_err(|source| SyncError::Read {
                        path: task.file_path.clone(),
                        source,
                    })?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            TaskKind::Delete => None,
        };

        let mut attempt = 0;
        let files = loop {
            match self.remote.list_files(org, project).await {
                Ok(files) => break files,
                Err(err) => self.pause_before_retry(err, &mut attempt).await?,
            }
        };
        let existing: Vec<&RemoteFile> = files.iter().filter(|f| f.file_name == name).collect();
        if content.is_none() && existing.is_empty() {
            debug!(name = %name, "nothing to delete remotely");
        }
        for file in &existing {
            self.delete_remote(org, project, &file.uuid).await?;
        }

        match content {
            Some(content) => {
                let mut attempt = 0;
                let created = loop {
                    match self.remote.upload(org, project, &name, &content).await {
                        Ok(created) => break created,
                        Err(err) => self.pause_before_retry(err, &mut attempt).await?,
                    }
                };
                info!(name = %name, id = %created.uuid, "uploaded");
            }
            None => info!(name = %name, "deleted remotely"),
        }
        Ok(())
    }

    async fn delete_remote(&self, org: &str, project: &str, id: &str) -> Result<(), ApiError> {
        let mut attempt = 0;
        loop {
            match self.remote.delete(org, project, id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_not_found() => {
                    debug!(id, "remote file already gone");
                    return Ok(());
                }
                Err(err) => self.pause_before_retry(err, &mut attempt).await?,
            }
        }
    }

    /// Sleeps before the next attempt of a retryable call, or hands the error
    /// back once the attempts are used up.
    async fn pause_before_retry(&self, err: ApiError, attempt: &mut u32) -> Result<(), ApiError> {
        if !err.is_retryable() || *attempt + 1 >= MAX_ATTEMPTS {
            return Err(err);
        }
        let delay = err
            .retry_after_secs()
            .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
            .unwrap_or_else(|| self.backoff.delay(*attempt));
        warn!(attempt = *attempt, ?delay, error = %err, "retrying remote call");
        tokio::time::sleep(delay).await;
        *attempt += 1;
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        if self.events.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

impl<R: RemoteSync> TaskProcessor for SyncEngine<R> {
    async fn process(&self, task: SyncTask) -> Result<(), SyncError> {
        let path = task.file_path.clone();
        let (started, finished) = match task.kind {
            TaskKind::Delete => (FileChangeKind::Deleting, FileChangeKind::Deleted),
            TaskKind::Add | TaskKind::Change => (FileChangeKind::Syncing, FileChangeKind::Synced),
        };
        self.notify(Notification::SyncStatusUpdate {
            path: path.clone(),
            status: SyncStatus::Syncing,
        });
        self.notify(Notification::FileChange {
            kind: started,
            path: path.clone(),
        });

        match self.apply(&task).await {
            Ok(()) => {
                self.notify(Notification::FileChange {
                    kind: finished,
                    path: path.clone(),
                });
                self.notify(Notification::SyncStatusUpdate {
                    path,
                    status: SyncStatus::Synced,
                });
                Ok(())
            }
            Err(err) => {
                self.notify(Notification::SyncStatusUpdate {
                    path: path.clone(),
                    status: SyncStatus::Error,
                });
                self.notify(Notification::SyncError {
                    message: format!("Failed to sync {}: {err}", path.display()),
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
