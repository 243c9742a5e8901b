use std::path::PathBuf;

use projmirror_core::Project;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::daemon::ServiceError;
use crate::sync::status::SyncStatus;
use crate::sync::tree::SyncItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileChangeKind {
    Add,
    Change,
    Delete,
    DeleteDirectory,
    Syncing,
    Synced,
    Deleting,
    Deleted,
}

/// Messages from the background service to the presentation side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    FileChange {
        kind: FileChangeKind,
        path: PathBuf,
    },
    SyncStatusUpdate {
        path: PathBuf,
        status: SyncStatus,
    },
    SyncError {
        message: String,
    },
    WatcherReady,
    SyncStopped,
    #[serde(rename_all = "camelCase")]
    ProjectChanged {
        project_id: String,
    },
}

pub type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Requests from the presentation side. Each carries its reply channel.
#[derive(Debug)]
pub enum Command {
    StartSync {
        paths: Vec<PathBuf>,
        reply: Reply<()>,
    },
    StopSync {
        reply: Reply<()>,
    },
    UploadFile {
        path: PathBuf,
        reply: Reply<()>,
    },
    DeleteRemoteFile {
        path: PathBuf,
        reply: Reply<()>,
    },
    /// `selected` is the dialog result; `None` means it was cancelled.
    SelectFilesAndFolders {
        selected: Option<Vec<PathBuf>>,
        existing: Vec<SyncItem>,
        reply: Reply<Vec<SyncItem>>,
    },
    SaveTrackedItems {
        items: Vec<SyncItem>,
        reply: Reply<()>,
    },
    GetTrackedItems {
        reply: Reply<Vec<SyncItem>>,
    },
    SetCurrentProject {
        project_id: String,
        reply: Reply<()>,
    },
    GetCurrentProject {
        reply: Reply<Option<String>>,
    },
    SetIgnored {
        path: PathBuf,
        ignored: bool,
        reply: Reply<Vec<SyncItem>>,
    },
    RemoveTrackedItem {
        path: PathBuf,
        reply: Reply<Vec<SyncItem>>,
    },
    ListProjects {
        reply: Reply<Vec<Project>>,
    },
}

/// Cloneable sender side of the command channel.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
}

impl ServiceHandle {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn start_sync(&self, paths: Vec<PathBuf>) -> Result<(), ServiceError> {
        self.request(|reply| Command::StartSync { paths, reply })
            .await
    }

    pub async fn stop_sync(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::StopSync { reply }).await
    }

    pub async fn upload_file(&self, path: PathBuf) -> Result<(), ServiceError> {
        self.request(|reply| Command::UploadFile { path, reply })
            .await
    }

    pub async fn delete_remote_file(&self, path: PathBuf) -> Result<(), ServiceError> {
        self.request(|reply| Command::DeleteRemoteFile { path, reply })
            .await
    }

    pub async fn select_files_and_folders(
        &self,
        selected: Option<Vec<PathBuf>>,
        existing: Vec<SyncItem>,
    ) -> Result<Vec<SyncItem>, ServiceError> {
        self.request(|reply| Command::SelectFilesAndFolders {
            selected,
            existing,
            reply,
        })
        .await
    }

    pub async fn save_tracked_items(&self, items: Vec<SyncItem>) -> Result<(), ServiceError> {
        self.request(|reply| Command::SaveTrackedItems { items, reply })
            .await
    }

    pub async fn get_tracked_items(&self) -> Result<Vec<SyncItem>, ServiceError> {
        self.request(|reply| Command::GetTrackedItems { reply })
            .await
    }

    pub async fn set_current_project(&self, project_id: String) -> Result<(), ServiceError> {
        self.request(|reply| Command::SetCurrentProject { project_id, reply })
            .await
    }

    pub async fn get_current_project(&self) -> Result<Option<String>, ServiceError> {
        self.request(|reply| Command::GetCurrentProject { reply })
            .await
    }

    pub async fn set_ignored(
        &self,
        path: PathBuf,
        ignored: bool,
    ) -> Result<Vec<SyncItem>, ServiceError> {
        self.request(|reply| Command::SetIgnored {
            path,
            ignored,
            reply,
        })
        .await
    }

    pub async fn remove_tracked_item(&self, path: PathBuf) -> Result<Vec<SyncItem>, ServiceError> {
        self.request(|reply| Command::RemoveTrackedItem { path, reply })
            .await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ServiceError> {
        self.request(|reply| Command::ListProjects { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ServiceError::Unavailable)?;
        response.await.map_err(|_| ServiceError::Unavailable)?
    }
}
