use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use projmirror_core::{ApiError, Project, RemoteFile, StatusCode};

use super::engine::RemoteSync;

/// In-memory project store used by engine and service tests.
#[derive(Default)]
pub struct FakeRemote {
    files: Mutex<Vec<(RemoteFile, String)>>,
    next_id: AtomicUsize,
    failing_lists: AtomicUsize,
    failing_uploads: Mutex<Option<StatusCode>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub fn with_file(self, file_name: &str, content: &str) -> Self {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().push((
            RemoteFile {
                uuid: format!("seed-{id}"),
                file_name: file_name.to_string(),
                created_at: None,
            },
            content.to_string(),
        ));
        self
    }

    /// Makes the next `count` list calls answer 503.
    pub fn fail_lists(&self, count: usize) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, status: StatusCode) {
        *self.failing_uploads.lock().unwrap() = Some(status);
    }

    pub fn names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|(file, _)| file.file_name.clone())
            .collect()
    }

    pub fn content_of(&self, file_name: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|(file, _)| file.file_name == file_name)
            .map(|(_, content)| content.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn api_error(status: StatusCode) -> ApiError {
    ApiError::Api {
        status,
        body: String::new(),
        retry_after: None,
    }
}

impl RemoteSync for FakeRemote {
    async fn list_projects(&self, _org: &str) -> Result<Vec<Project>, ApiError> {
        self.record("projects".to_string());
        Ok(vec![Project {
            uuid: "proj-1".to_string(),
            name: "Demo".to_string(),
        }])
    }

    async fn list_files(&self, _org: &str, _project: &str) -> Result<Vec<RemoteFile>, ApiError> {
        self.record("list".to_string());
        if self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE));
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(file, _)| file.clone())
            .collect())
    }

    async fn upload(
        &self,
        _org: &str,
        _project: &str,
        file_name: &str,
        content: &str,
    ) -> Result<RemoteFile, ApiError> {
        self.record(format!("upload {file_name}"));
        if let Some(status) = *self.failing_uploads.lock().unwrap() {
            return Err(api_error(status));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = RemoteFile {
            uuid: format!("doc-{id}"),
            file_name: file_name.to_string(),
            created_at: None,
        };
        self.files
            .lock()
            .unwrap()
            .push((created.clone(), content.to_string()));
        Ok(created)
    }

    async fn delete(&self, _org: &str, _project: &str, file_id: &str) -> Result<(), ApiError> {
        self.record(format!("delete {file_id}"));
        let mut files = self.files.lock().unwrap();
        let before = files.len();
        files.retain(|(file, _)| file.uuid != file_id);
        if files.len() == before {
            return Err(api_error(StatusCode::NOT_FOUND));
        }
        Ok(())
    }
}
