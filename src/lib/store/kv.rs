use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::types::{Store, StoreError, TaskQuery};
use crate::lib::tasks::types::Task;

const EXTENSION: &str = "json";

/// Key-value backend: task id string -> JSON-encoded record. With a
/// directory every value is also written to `<dir>/<id>.json` and read
/// back on open; without one the values live only as long as the process.
#[derive(Debug, Default)]
pub struct KvStore {
    dir: Option<PathBuf>,
    entries: RwLock<HashMap<String, String>>,
}

impl KvStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            entries.insert(key.to_string(), fs::read_to_string(&path)?);
        }
        debug!(dir = %dir.display(), records = entries.len(), "opened key-value store");

        Ok(KvStore {
            dir: Some(dir),
            entries: RwLock::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    fn value_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(key).with_extension(EXTENSION)
    }

    fn decode(key: &str, value: &str) -> Result<Task, StoreError> {
        serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
            id: key.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Store for KvStore {
    fn get(&self, id: &Uuid) -> Result<Option<Task>, StoreError> {
        let key = id.to_string();
        self.entries
            .read()
            .get(&key)
            .map(|value| Self::decode(&key, value))
            .transpose()
    }

    fn put(&self, task: &Task) -> Result<(), StoreError> {
        let key = task.id.to_string();
        let value = serde_json::to_string(task)?;

        let mut entries = self.entries.write();
        if let Some(dir) = &self.dir {
            // Write then rename so a crash never leaves half a record.
            let path = Self::value_path(dir, &key);
            let staging = path.with_extension("tmp");
            fs::write(&staging, &value)?;
            fs::rename(&staging, &path)?;
        }
        entries.insert(key, value);
        Ok(())
    }

    /// Ordered by start time, then id, the same order the SQLite backend uses.
    fn query(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError> {
        let entries = self.entries.read();
        let mut tasks = Vec::new();
        for (key, value) in entries.iter() {
            let task = Self::decode(key, value)?;
            if query.matches(&task) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| (a.start_time, a.id).cmp(&(b.start_time, b.id)));
        Ok(tasks)
    }

    fn backend(&self) -> &'static str {
        if self.dir.is_some() { "kv" } else { "memory" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::types::State;
    use chrono::{Duration, Utc};

    #[test]
    fn put_then_get_returns_identical_record() {
        let store = KvStore::in_memory();
        let mut task = Task::new("web", "nginx:latest");
        task.start_time = Some(Utc::now());
        task.port_bindings.insert("80".to_string(), "8080".to_string());

        store.put(&task).unwrap();

        assert_eq!(store.get(&task.id).unwrap(), Some(task));
    }

    #[test]
    fn missing_id_is_none() {
        assert_eq!(KvStore::in_memory().get(&Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn put_replaces_previous_value() {
        let store = KvStore::in_memory();
        let mut task = Task::new("web", "nginx");
        store.put(&task).unwrap();
        task.state = State::Running;
        store.put(&task).unwrap();

        assert_eq!(store.get(&task.id).unwrap().map(|t| t.state), Some(State::Running));
        assert_eq!(store.query(&TaskQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn query_filters_by_state() {
        let store = KvStore::in_memory();
        for (name, state) in [("a", State::Running), ("b", State::Failed), ("c", State::Running)] {
            let mut task = Task::new(name, "nginx");
            task.state = state;
            store.put(&task).unwrap();
        }

        let running = store.query(&TaskQuery::by_state(State::Running)).unwrap();
        assert_eq!(running.len(), 2);
        assert!(running.iter().all(|t| t.state == State::Running));
    }

    #[test]
    fn query_orders_by_start_time_then_id() {
        let store = KvStore::in_memory();
        let now = Utc::now();
        let mut late = Task::new("late", "nginx");
        late.start_time = Some(now);
        let mut early = Task::new("early", "nginx");
        early.start_time = Some(now - Duration::seconds(5));
        let unstarted = Task::new("unstarted", "nginx");
        for task in [&late, &unstarted, &early] {
            store.put(task).unwrap();
        }

        let names: Vec<String> = store
            .query(&TaskQuery::default())
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();

        assert_eq!(names, vec!["unstarted", "early", "late"]);
    }

    #[test]
    fn reopening_a_directory_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new("web", "nginx");
        task.state = State::Scheduled;
        {
            let store = KvStore::open(dir.path()).unwrap();
            store.put(&task).unwrap();
            assert_eq!(store.backend(), "kv");
        }

        let reopened = KvStore::open(dir.path()).unwrap();

        assert!(dir.path().join(format!("{}.json", task.id)).exists());
        assert_eq!(reopened.get(&task.id).unwrap(), Some(task));
    }

    #[test]
    fn corrupt_values_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        fs::write(dir.path().join(format!("{}.json", id)), "{not json").unwrap();

        let store = KvStore::open(dir.path()).unwrap();

        assert!(matches!(store.get(&id), Err(StoreError::Corrupt { .. })));
    }
}
