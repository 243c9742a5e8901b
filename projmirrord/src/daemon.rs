use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use projmirror_core::{ApiError, Project};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::protocol::{Command, FileChangeKind, Notification, ServiceHandle};
use crate::storage::{KeyValueStore, Settings, StoreError};
use crate::sync::engine::{RemoteSync, SyncEngine};
use crate::sync::ignore::IgnoreClassifier;
use crate::sync::local_watcher::{ChangeDetector, ChangeEvent};
use crate::sync::queue::{QueueError, SyncQueue, SyncTask, TaskKind};
use crate::sync::roots::SyncRootResolver;
use crate::sync::status::SyncStatus;
use crate::sync::tree::{SyncItem, SyncTree, build_items};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid watch paths: {0}")]
    Validation(String),
    #[error("no project selected")]
    NoProject,
    #[error("{0} is not inside a tracked item")]
    NotTracked(PathBuf),
    #[error("{0} is ignored")]
    Ignored(PathBuf),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] ApiError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("background service is unavailable")]
    Unavailable,
}

/// Everything the service needs to know about who it is syncing for.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub organization_id: String,
    pub config: DaemonConfig,
}

type ChangeStream = Option<mpsc::UnboundedReceiver<ChangeEvent>>;

/// Background half of the application. Owns the tracked tree, the watcher
/// and the queue; the presentation side talks to it through [`ServiceHandle`].
pub struct SyncService<R, S> {
    context: AppContext,
    settings: Settings<S>,
    engine: Arc<SyncEngine<R>>,
    queue: Option<SyncQueue>,
    detector: ChangeDetector,
    classifier: IgnoreClassifier,
    notifications: mpsc::UnboundedSender<Notification>,
    project_id: Option<String>,
    tree: SyncTree,
    /// Latest tree, read by the watcher to filter paths.
    published: watch::Sender<SyncTree>,
}

impl<R: RemoteSync, S: KeyValueStore> SyncService<R, S> {
    /// Spawns the service on the current runtime. The task ends once every
    /// handle has been dropped.
    pub fn spawn(
        context: AppContext,
        store: S,
        remote: R,
    ) -> (
        ServiceHandle,
        mpsc::UnboundedReceiver<Notification>,
        JoinHandle<()>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(SyncEngine::new(remote, notification_tx.clone()));
        let queue = SyncQueue::new(engine.clone(), context.config.workers);
        let service = Self {
            classifier: context.config.classifier(),
            context,
            settings: Settings::new(store),
            engine,
            queue: Some(queue),
            detector: ChangeDetector::new(),
            notifications: notification_tx,
            project_id: None,
            tree: SyncTree::new(),
            published: watch::channel(SyncTree::new()).0,
        };
        let task = tokio::spawn(service.run(command_rx));
        (ServiceHandle::new(command_tx), notification_rx, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        if let Err(err) = self.load_current_project().await {
            warn!(error = %err, "failed to restore current project");
            self.notify(Notification::SyncError {
                message: format!("Failed to restore project: {err}"),
            });
        }

        let mut changes: ChangeStream = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut changes).await,
                    None => break,
                },
                event = next_change(&mut changes) => match event {
                    Some(event) => self.handle_change(event).await,
                    None => changes = None,
                },
            }
        }

        self.detector.stop();
        if let Some(queue) = self.queue.take() {
            queue.shutdown().await;
        }
        info!("sync service stopped");
    }

    async fn handle_command(&mut self, command: Command, changes: &mut ChangeStream) {
        match command {
            Command::StartSync { paths, reply } => {
                let result = self.start_sync(paths, changes);
                if let Err(err) = &result {
                    warn!(error = %err, "sync not started");
                    self.notify(Notification::SyncError {
                        message: format!("Failed to start sync: {err}"),
                    });
                }
                respond(reply, result);
            }
            Command::StopSync { reply } => {
                self.stop_sync(changes);
                respond(reply, Ok(()));
            }
            Command::UploadFile { path, reply } => {
                let result = self.enqueue_explicit(&path, TaskKind::Change).await;
                respond(reply, result);
            }
            Command::DeleteRemoteFile { path, reply } => {
                let result = self.enqueue_explicit(&path, TaskKind::Delete).await;
                respond(reply, result);
            }
            Command::SelectFilesAndFolders {
                selected,
                existing,
                reply,
            } => {
                let result = self.select(selected, existing).await;
                respond(reply, result);
            }
            Command::SaveTrackedItems { items, reply } => {
                let result = self.save_items(items).await;
                respond(reply, result);
            }
            Command::GetTrackedItems { reply } => {
                respond(reply, Ok(self.tree.to_items()));
            }
            Command::SetCurrentProject { project_id, reply } => {
                let result = self.set_project(project_id, changes).await;
                respond(reply, result);
            }
            Command::GetCurrentProject { reply } => {
                respond(reply, Ok(self.project_id.clone()));
            }
            Command::SetIgnored {
                path,
                ignored,
                reply,
            } => {
                let result = self.set_ignored(&path, ignored).await;
                respond(reply, result);
            }
            Command::RemoveTrackedItem { path, reply } => {
                let result = self.remove_item(&path).await;
                respond(reply, result);
            }
            Command::ListProjects { reply } => {
                let result = self.list_projects().await;
                respond(reply, result);
            }
        }
    }

    async fn load_current_project(&mut self) -> Result<(), ServiceError> {
        self.project_id = self.settings.current_project().await?;
        self.tree = match &self.project_id {
            Some(project_id) => {
                SyncTree::from_items(self.settings.tracked_items(project_id).await?)
                    .with_removed(self.settings.removed_paths(project_id).await?)
            }
            None => SyncTree::new(),
        };
        self.publish_tree();
        debug!(project = ?self.project_id, items = self.tree.len(), "project loaded");
        Ok(())
    }

    fn start_sync(
        &mut self,
        paths: Vec<PathBuf>,
        changes: &mut ChangeStream,
    ) -> Result<(), ServiceError> {
        if paths.is_empty() {
            return Err(ServiceError::Validation("no paths to watch".to_string()));
        }
        if let Some(relative) = paths.iter().find(|path| !path.is_absolute()) {
            return Err(ServiceError::Validation(format!(
                "{} is not an absolute path",
                relative.display()
            )));
        }
        if self.project_id.is_none() {
            return Err(ServiceError::NoProject);
        }
        let roots: Vec<PathBuf> = paths
            .into_iter()
            .filter(|path| !self.is_filtered(path, path))
            .collect();
        if roots.is_empty() {
            return Err(ServiceError::Validation(
                "every path is ignored".to_string(),
            ));
        }

        if self.detector.is_running() {
            self.stop_sync(changes);
        }
        info!(roots = roots.len(), "starting sync");
        *changes = Some(self.detector.start(
            &roots,
            self.classifier.clone(),
            self.published.subscribe(),
            self.context.config.watch_options(),
        ));
        Ok(())
    }

    fn stop_sync(&mut self, changes: &mut ChangeStream) {
        self.detector.stop();
        *changes = None;
        self.notify(Notification::SyncStopped);
    }

    async fn enqueue_explicit(&mut self, path: &Path, kind: TaskKind) -> Result<(), ServiceError> {
        let project_id = self.project_id.clone().ok_or(ServiceError::NoProject)?;
        let root = SyncRootResolver::new(&self.tree)
            .resolve(path)
            .ok_or_else(|| ServiceError::NotTracked(path.to_path_buf()))?;
        if kind != TaskKind::Delete {
            if self.is_filtered(&root.sync_root, path) {
                return Err(ServiceError::Ignored(path.to_path_buf()));
            }
            self.discover(&project_id, path).await;
        }
        self.enqueue(SyncTask {
            organization_id: self.context.organization_id.clone(),
            project_id,
            file_path: path.to_path_buf(),
            sync_root: root.sync_root,
            kind,
        })
    }

    async fn select(
        &mut self,
        selected: Option<Vec<PathBuf>>,
        existing: Vec<SyncItem>,
    ) -> Result<Vec<SyncItem>, ServiceError> {
        let Some(selected) = selected else {
            debug!("selection cancelled");
            return Ok(existing);
        };
        let mut tree = SyncTree::from_items(existing).with_removed(self.tree.removed_paths());
        tree.merge(build_items(&selected, &self.classifier).await);
        self.tree = tree;
        self.publish_tree();
        match self.project_id.clone() {
            Some(project_id) => self.persist_tree(&project_id).await,
            None => {
                debug!("no project selected; merged items not persisted");
                Ok(self.tree.to_items())
            }
        }
    }

    async fn save_items(&mut self, items: Vec<SyncItem>) -> Result<(), ServiceError> {
        let project_id = self.project_id.as_deref().ok_or(ServiceError::NoProject)?;
        self.settings.save_tracked_items(project_id, &items).await?;
        self.tree = SyncTree::from_items(items).with_removed(self.tree.removed_paths());
        self.publish_tree();
        Ok(())
    }

    async fn set_project(
        &mut self,
        project_id: String,
        changes: &mut ChangeStream,
    ) -> Result<(), ServiceError> {
        if self.project_id.as_deref() == Some(project_id.as_str()) {
            return Ok(());
        }
        if self.detector.is_running() {
            self.stop_sync(changes);
        }
        self.settings.set_current_project(&project_id).await?;
        self.load_current_project().await?;
        info!(project = %project_id, "current project changed");
        self.notify(Notification::ProjectChanged { project_id });
        Ok(())
    }

    async fn set_ignored(
        &mut self,
        path: &Path,
        ignored: bool,
    ) -> Result<Vec<SyncItem>, ServiceError> {
        let project_id = self.project_id.clone().ok_or(ServiceError::NoProject)?;
        let before: HashSet<PathBuf> = self.tree.files_under(path).into_iter().collect();
        if self.tree.set_ignored(path, ignored).is_none() {
            return Err(ServiceError::NotTracked(path.to_path_buf()));
        }
        let after: HashSet<PathBuf> = self.tree.files_under(path).into_iter().collect();
        self.publish_tree();
        let items = self.persist_tree(&project_id).await?;

        let (changed, kind) = if ignored {
            (before.difference(&after), TaskKind::Delete)
        } else {
            (after.difference(&before), TaskKind::Add)
        };
        let mut changed: Vec<PathBuf> = changed.cloned().collect();
        changed.sort();
        let resolver = SyncRootResolver::new(&self.tree);
        let tasks: Vec<SyncTask> = changed
            .into_iter()
            .filter_map(|file| {
                let root = resolver.resolve(&file)?;
                Some(SyncTask {
                    organization_id: self.context.organization_id.clone(),
                    project_id: project_id.clone(),
                    file_path: file,
                    sync_root: root.sync_root,
                    kind,
                })
            })
            .collect();
        info!(path = %path.display(), ignored, tasks = tasks.len(), "ignore toggled");
        for task in tasks {
            self.enqueue(task)?;
        }
        Ok(items)
    }

    async fn remove_item(&mut self, path: &Path) -> Result<Vec<SyncItem>, ServiceError> {
        let project_id = self.project_id.clone().ok_or(ServiceError::NoProject)?;
        if !self.tree.remove(path) {
            return Err(ServiceError::NotTracked(path.to_path_buf()));
        }
        self.publish_tree();
        self.persist_tree(&project_id).await
    }

    async fn list_projects(&mut self) -> Result<Vec<Project>, ServiceError> {
        Ok(self
            .engine
            .remote()
            .list_projects(&self.context.organization_id)
            .await?)
    }

    async fn handle_change(&mut self, event: ChangeEvent) {
        let (kind, path, task_kind) = match event {
            ChangeEvent::Ready => {
                info!("initial scan complete; watching for changes");
                self.notify(Notification::WatcherReady);
                return;
            }
            ChangeEvent::Error { path, message } => {
                let message = match path {
                    Some(path) => format!("Watch error for {}: {message}", path.display()),
                    None => format!("Watch error: {message}"),
                };
                self.notify(Notification::SyncError { message });
                return;
            }
            ChangeEvent::DeleteDirectory(path) => {
                self.notify(Notification::FileChange {
                    kind: FileChangeKind::DeleteDirectory,
                    path,
                });
                return;
            }
            ChangeEvent::Add(path) => (FileChangeKind::Add, path, TaskKind::Add),
            ChangeEvent::Change(path) => (FileChangeKind::Change, path, TaskKind::Change),
            ChangeEvent::DeleteFile(path) => (FileChangeKind::Delete, path, TaskKind::Delete),
        };
        self.notify(Notification::FileChange {
            kind,
            path: path.clone(),
        });

        let Some(project_id) = self.project_id.clone() else {
            debug!(path = %path.display(), "no project selected; change dropped");
            return;
        };
        let Some(root) = SyncRootResolver::new(&self.tree).resolve(&path) else {
            debug!(path = %path.display(), "change outside tracked roots");
            return;
        };
        if self.is_filtered(&root.sync_root, &path) {
            debug!(path = %path.display(), "change on ignored path");
            return;
        }
        if task_kind != TaskKind::Delete {
            self.discover(&project_id, &path).await;
        }
        let task = SyncTask {
            organization_id: self.context.organization_id.clone(),
            project_id,
            file_path: path,
            sync_root: root.sync_root,
            kind: task_kind,
        };
        if let Err(err) = self.enqueue(task) {
            warn!(error = %err, "failed to enqueue change");
        }
    }

    /// Marks the path queued, then hands the task over.
    fn enqueue(&mut self, task: SyncTask) -> Result<(), ServiceError> {
        let path = task.file_path.clone();
        let queue = self.queue.as_ref().ok_or(QueueError::Closed)?;
        self.notify(Notification::SyncStatusUpdate {
            path: path.clone(),
            status: SyncStatus::Queued,
        });
        if let Err(err) = queue.add(task) {
            self.notify(Notification::SyncStatusUpdate {
                path: path.clone(),
                status: SyncStatus::Error,
            });
            self.notify(Notification::SyncError {
                message: format!("Failed to queue {}: {err}", path.display()),
            });
            return Err(err.into());
        }
        debug!(path = %path.display(), pending = queue.pending(), "task queued");
        Ok(())
    }

    fn is_filtered(&self, root: &Path, path: &Path) -> bool {
        self.tree
            .is_path_ignored(&self.classifier, root, path, path.is_dir())
    }

    /// Adds a file first seen after selection to the tree, so that later
    /// toggles on its directory reach it.
    async fn discover(&mut self, project_id: &str, path: &Path) {
        if path.is_dir() || !self.tree.track_discovered(path) {
            return;
        }
        self.publish_tree();
        if let Err(err) = self.persist_tree(project_id).await {
            warn!(path = %path.display(), error = %err, "failed to save discovered file");
        }
    }

    /// Saves the tracked items and removals of `project_id`.
    async fn persist_tree(&self, project_id: &str) -> Result<Vec<SyncItem>, ServiceError> {
        let items = self.tree.to_items();
        self.settings.save_tracked_items(project_id, &items).await?;
        self.settings
            .save_removed_paths(project_id, &self.tree.removed_paths())
            .await?;
        Ok(items)
    }

    fn publish_tree(&self) {
        self.published.send_replace(self.tree.clone());
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

async fn next_change(changes: &mut ChangeStream) -> Option<ChangeEvent> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn respond<T>(reply: oneshot::Sender<Result<T, ServiceError>>, result: Result<T, ServiceError>) {
    if reply.send(result).is_err() {
        debug!("requester went away before the reply");
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
