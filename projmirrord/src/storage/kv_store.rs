use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::sync::tree::SyncItem;

const CURRENT_PROJECT_KEY: &str = "currentProjectId";
const ORGANIZATION_KEY: &str = "organizationId";
const TRACKED_ITEMS_KEY: &str = "syncItems";
const REMOVED_PATHS_KEY: &str = "removedPaths";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
}

/// Namespace a key lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Project(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Project(id) => write!(f, "project:{id}"),
        }
    }
}

/// Scoped string storage. Values are opaque to the store.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get_raw(
        &self,
        scope: &Scope,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn set_raw(
        &self,
        scope: &Scope,
        key: &str,
        value: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, scope: &Scope, key: &str)
    -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<(String, String), String>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut entries)
    }
}

impl KeyValueStore for MemoryStore {
    async fn get_raw(&self, scope: &Scope, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_entries(|entries| entries.get(&(scope.to_string(), key.to_string())).cloned()))
    }

    async fn set_raw(&self, scope: &Scope, key: &str, value: String) -> Result<(), StoreError> {
        self.with_entries(|entries| entries.insert((scope.to_string(), key.to_string()), value));
        Ok(())
    }

    async fn delete(&self, scope: &Scope, key: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| entries.remove(&(scope.to_string(), key.to_string())));
        Ok(())
    }
}

/// Typed view over a [`KeyValueStore`] holding JSON values.
#[derive(Debug, Clone)]
pub struct Settings<S> {
    store: S,
}

impl<S: KeyValueStore> Settings<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        scope: &Scope,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.store.get_raw(scope, key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + Sync + ?Sized>(
        &self,
        scope: &Scope,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.store.set_raw(scope, key, raw).await
    }

    pub async fn current_project(&self) -> Result<Option<String>, StoreError> {
        self.get_json(&Scope::Global, CURRENT_PROJECT_KEY).await
    }

    pub async fn set_current_project(&self, project_id: &str) -> Result<(), StoreError> {
        self.set_json(&Scope::Global, CURRENT_PROJECT_KEY, project_id)
            .await
    }

    pub async fn organization_id(&self) -> Result<Option<String>, StoreError> {
        self.get_json(&Scope::Global, ORGANIZATION_KEY).await
    }

    pub async fn set_organization_id(&self, organization_id: &str) -> Result<(), StoreError> {
        self.set_json(&Scope::Global, ORGANIZATION_KEY, organization_id)
            .await
    }

    /// Tracked items of a project; an unknown project has none.
    pub async fn tracked_items(&self, project_id: &str) -> Result<Vec<SyncItem>, StoreError> {
        let scope = Scope::Project(project_id.to_string());
        Ok(self
            .get_json(&scope, TRACKED_ITEMS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn save_tracked_items(
        &self,
        project_id: &str,
        items: &[SyncItem],
    ) -> Result<(), StoreError> {
        let scope = Scope::Project(project_id.to_string());
        self.set_json(&scope, TRACKED_ITEMS_KEY, items).await
    }

    /// Paths the user removed from inside a tracked directory.
    pub async fn removed_paths(&self, project_id: &str) -> Result<Vec<PathBuf>, StoreError> {
        let scope = Scope::Project(project_id.to_string());
        Ok(self
            .get_json(&scope, REMOVED_PATHS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn save_removed_paths(
        &self,
        project_id: &str,
        paths: &[PathBuf],
    ) -> Result<(), StoreError> {
        let scope = Scope::Project(project_id.to_string());
        if paths.is_empty() {
            return self.store.delete(&scope, REMOVED_PATHS_KEY).await;
        }
        self.set_json(&scope, REMOVED_PATHS_KEY, paths).await
    }

    pub async fn clear_tracked_items(&self, project_id: &str) -> Result<(), StoreError> {
        let scope = Scope::Project(project_id.to_string());
        self.store.delete(&scope, TRACKED_ITEMS_KEY).await?;
        self.store.delete(&scope, REMOVED_PATHS_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ignore::IgnoreReason;
    use std::path::PathBuf;

    fn item(path: &str) -> SyncItem {
        serde_json::from_value(serde_json::json!({
            "name": path.rsplit('/').next().unwrap(),
            "path": path,
            "isDirectory": false,
            "ignored": false,
            "ignoreReason": "none"
        }))
        .unwrap()
    }

    #[test]
    fn scope_keys() {
        assert_eq!(Scope::Global.to_string(), "global");
        assert_eq!(Scope::Project("p1".into()).to_string(), "project:p1");
    }

    #[tokio::test]
    async fn memory_store_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let scope = Scope::Project("p".into());
        assert_eq!(store.get_raw(&scope, "k").await.unwrap(), None);

        store.set_raw(&scope, "k", "v1".into()).await.unwrap();
        store.set_raw(&scope, "k", "v2".into()).await.unwrap();
        assert_eq!(store.get_raw(&scope, "k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(store.get_raw(&Scope::Global, "k").await.unwrap(), None);

        store.delete(&scope, "k").await.unwrap();
        store.delete(&scope, "k").await.unwrap();
        assert_eq!(store.get_raw(&scope, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn tracked_items_are_kept_per_project() {
        let settings = Settings::new(MemoryStore::new());
        settings
            .save_tracked_items("a", &[item("/r/a.txt")])
            .await
            .unwrap();

        let loaded = settings.tracked_items("a").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].path, PathBuf::from("/r/a.txt"));
        assert_eq!(loaded[0].ignore_reason, IgnoreReason::None);
        assert!(settings.tracked_items("b").await.unwrap().is_empty());

        settings.clear_tracked_items("a").await.unwrap();
        assert!(settings.tracked_items("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removed_paths_are_kept_per_project() {
        let settings = Settings::new(MemoryStore::new());
        assert!(settings.removed_paths("a").await.unwrap().is_empty());

        settings
            .save_removed_paths("a", &[PathBuf::from("/r/docs/README.md")])
            .await
            .unwrap();
        assert_eq!(
            settings.removed_paths("a").await.unwrap(),
            vec![PathBuf::from("/r/docs/README.md")]
        );
        assert!(settings.removed_paths("b").await.unwrap().is_empty());

        settings.save_removed_paths("a", &[]).await.unwrap();
        assert!(settings.removed_paths("a").await.unwrap().is_empty());

        settings
            .save_removed_paths("a", &[PathBuf::from("/r/old")])
            .await
            .unwrap();
        settings.clear_tracked_items("a").await.unwrap();
        assert!(settings.removed_paths("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn global_values() {
        let settings = Settings::new(MemoryStore::new());
        assert_eq!(settings.current_project().await.unwrap(), None);
        settings.set_current_project("p-9").await.unwrap();
        settings.set_organization_id("org-2").await.unwrap();
        assert_eq!(settings.current_project().await.unwrap().as_deref(), Some("p-9"));
        assert_eq!(settings.organization_id().await.unwrap().as_deref(), Some("org-2"));
    }

    #[tokio::test]
    async fn corrupt_value_is_a_json_error() {
        let settings = Settings::new(MemoryStore::new());
        settings
            .store()
            .set_raw(&Scope::Global, CURRENT_PROJECT_KEY, "{not json".into())
            .await
            .unwrap();
        assert!(matches!(
            settings.current_project().await,
            Err(StoreError::Json(_))
        ));
    }
}
