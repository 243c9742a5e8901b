use std::fs;
use std::path::Path;

use sqlx::Row;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tracing::debug;

use super::kv_store::{KeyValueStore, Scope, StoreError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DB_FILENAME: &str = "state.db";

/// Key-value store backed by a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Opens (or creates) `state.db` inside `data_dir`.
    pub async fn open_in(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILENAME);
        debug!(path = %db_path.display(), "opening state database");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let data_dir = dirs::data_dir()
            .ok_or(StoreError::MissingDataDir)?
            .join("projmirror");
        Self::open_in(&data_dir).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    async fn get_raw(&self, scope: &Scope, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE scope = ?1 AND key = ?2")
            .bind(scope.to_string())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(row.try_get("value")?))
    }

    async fn set_raw(&self, scope: &Scope, key: &str, value: String) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (scope, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(scope, key) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%s', 'now')",
        )
        .bind(scope.to_string())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, scope: &Scope, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE scope = ?1 AND key = ?2")
            .bind(scope.to_string())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv_store::Settings;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn make_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_get_delete() {
        let store = make_store().await;
        let scope = Scope::Project("p1".into());

        store.set_raw(&scope, "syncItems", "[]".into()).await.unwrap();
        store.set_raw(&scope, "syncItems", "[1]".into()).await.unwrap();
        assert_eq!(
            store.get_raw(&scope, "syncItems").await.unwrap().as_deref(),
            Some("[1]")
        );
        assert_eq!(store.get_raw(&Scope::Global, "syncItems").await.unwrap(), None);

        store.delete(&scope, "syncItems").await.unwrap();
        assert_eq!(store.get_raw(&scope, "syncItems").await.unwrap(), None);
    }

    #[tokio::test]
    async fn init_is_repeatable() {
        let store = make_store().await;
        store.init().await.unwrap();
        store.set_raw(&Scope::Global, "k", "1".into()).await.unwrap();
        assert!(store.get_raw(&Scope::Global, "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let settings = Settings::new(SqliteStore::open_in(dir.path()).await.unwrap());
            settings.set_current_project("proj-7").await.unwrap();
        }
        let settings = Settings::new(SqliteStore::open_in(dir.path()).await.unwrap());
        assert_eq!(
            settings.current_project().await.unwrap().as_deref(),
            Some("proj-7")
        );
    }
}
