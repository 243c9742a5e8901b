pub mod credentials;
pub mod kv_store;
pub mod sqlite_store;

pub use credentials::{CredentialError, CredentialStorage};
pub use kv_store::{KeyValueStore, MemoryStore, Scope, Settings, StoreError};
pub use sqlite_store::SqliteStore;
