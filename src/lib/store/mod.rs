use std::sync::Arc;

use crate::lib::config::types::{StoreBackend, StoreConfig};

pub mod kv;
pub mod sqlite;
pub mod types;

use kv::KvStore;
use sqlite::SqliteStore;
use types::{Store, StoreError};

/// Picks the backend once, at startup. Callers only ever see the trait.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(KvStore::in_memory())),
        StoreBackend::Kv => Ok(Arc::new(KvStore::open(&config.path)?)),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_configured_backend() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = StoreConfig {
            backend: StoreBackend::Sqlite,
            path: dir.path().join("tasks.db").to_string_lossy().into_owned(),
        };
        let kv = StoreConfig {
            backend: StoreBackend::Kv,
            path: dir.path().join("tasks").to_string_lossy().into_owned(),
        };
        let memory = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };

        assert_eq!(open_store(&sqlite).unwrap().backend(), "sqlite");
        assert_eq!(open_store(&kv).unwrap().backend(), "kv");
        assert!(dir.path().join("tasks").is_dir());
        assert_eq!(open_store(&memory).unwrap().backend(), "memory");
    }
}
