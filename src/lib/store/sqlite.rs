//! Relational backend: one row per task, schema created on open.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::debug;
use uuid::Uuid;

use super::types::{Store, StoreError, TaskQuery};
use crate::lib::tasks::types::Task;

const SCHEMA_VERSION: i32 = 1;

const COLUMNS: &str = "id, name, state, image, memory, disk, cpus, exposed_ports, \
     port_bindings, restart_policy, env, start_time, finish_time, end_time, \
     container_id, message";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                image TEXT NOT NULL,
                memory INTEGER NOT NULL DEFAULT 0,
                disk INTEGER NOT NULL DEFAULT 0,
                cpus REAL NOT NULL DEFAULT 0,
                exposed_ports TEXT NOT NULL DEFAULT '[]',
                port_bindings TEXT NOT NULL DEFAULT '{}',
                restart_policy TEXT NOT NULL DEFAULT '',
                env TEXT NOT NULL DEFAULT '[]',
                start_time TEXT,
                finish_time TEXT,
                end_time TEXT,
                container_id TEXT,
                message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_name_state ON tasks(name, state);
            CREATE INDEX IF NOT EXISTS idx_tasks_container ON tasks(container_id);
            "#,
        )?;

        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            debug!(from = current, to = SCHEMA_VERSION, "task schema migrated");
        }
        Ok(())
    }
}

/// Raw column values, decoded into a `Task` outside the rusqlite closure
/// so decoding failures keep their own error type.
struct TaskRow {
    id: String,
    name: String,
    state: String,
    image: String,
    memory: i64,
    disk: i64,
    cpus: f64,
    exposed_ports: String,
    port_bindings: String,
    restart_policy: String,
    env: String,
    start_time: Option<String>,
    finish_time: Option<String>,
    end_time: Option<String>,
    container_id: Option<String>,
    message: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TaskRow {
            id: row.get(0)?,
            name: row.get(1)?,
            state: row.get(2)?,
            image: row.get(3)?,
            memory: row.get(4)?,
            disk: row.get(5)?,
            cpus: row.get(6)?,
            exposed_ports: row.get(7)?,
            port_bindings: row.get(8)?,
            restart_policy: row.get(9)?,
            env: row.get(10)?,
            start_time: row.get(11)?,
            finish_time: row.get(12)?,
            end_time: row.get(13)?,
            container_id: row.get(14)?,
            message: row.get(15)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let time = |value: &Option<String>| -> Result<Option<DateTime<Utc>>, StoreError> {
            value
                .as_deref()
                .map(|v| {
                    DateTime::parse_from_rfc3339(v)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| corrupt(format!("timestamp {}: {}", v, e)))
                })
                .transpose()
        };

        Ok(Task {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?,
            state: self.state.parse().map_err(|e| corrupt(format!("{}", e)))?,
            exposed_ports: serde_json::from_str(&self.exposed_ports)
                .map_err(|e| corrupt(e.to_string()))?,
            port_bindings: serde_json::from_str(&self.port_bindings)
                .map_err(|e| corrupt(e.to_string()))?,
            env: serde_json::from_str(&self.env).map_err(|e| corrupt(e.to_string()))?,
            start_time: time(&self.start_time)?,
            finish_time: time(&self.finish_time)?,
            end_time: time(&self.end_time)?,
            name: self.name,
            image: self.image,
            memory: self.memory,
            disk: self.disk,
            cpus: self.cpus,
            restart_policy: self.restart_policy,
            container_id: self.container_id,
            message: self.message,
        })
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

impl Store for SqliteStore {
    fn get(&self, id: &Uuid) -> Result<Option<Task>, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                params![id.to_string()],
                TaskRow::from_row,
            )
            .optional()?;

        row.map(TaskRow::into_task).transpose()
    }

    fn put(&self, task: &Task) -> Result<(), StoreError> {
        let exposed_ports = serde_json::to_string(&task.exposed_ports)?;
        let port_bindings = serde_json::to_string(&task.port_bindings)?;
        let env = serde_json::to_string(&task.env)?;

        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO tasks ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                COLUMNS
            ),
            params![
                task.id.to_string(),
                task.name,
                task.state.as_str(),
                task.image,
                task.memory,
                task.disk,
                task.cpus,
                exposed_ports,
                port_bindings,
                task.restart_policy,
                env,
                timestamp(task.start_time),
                timestamp(task.finish_time),
                timestamp(task.end_time),
                task.container_id,
                task.message,
            ],
        )?;
        Ok(())
    }

    fn query(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError> {
        let mut sql = format!("SELECT {} FROM tasks WHERE 1 = 1", COLUMNS);
        let mut values: Vec<String> = Vec::new();

        if let Some(name) = &query.name {
            values.push(name.clone());
            sql.push_str(&format!(" AND name = ?{}", values.len()));
        }
        if let Some(state) = &query.state {
            values.push(state.as_str().to_string());
            sql.push_str(&format!(" AND state = ?{}", values.len()));
        }
        if let Some(container_id) = &query.container_id {
            values.push(container_id.clone());
            sql.push_str(&format!(" AND container_id = ?{}", values.len()));
        }
        // Fixed-width RFC3339 text sorts chronologically; NULL start times first.
        sql.push_str(" ORDER BY start_time, id");

        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), TaskRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::types::State;

    fn sample() -> Task {
        let mut task = Task::new("web", "nginx:latest");
        task.state = State::Running;
        task.memory = 128;
        task.cpus = 0.5;
        task.exposed_ports = vec![443];
        task.port_bindings.insert("80".to_string(), "8080".to_string());
        task.restart_policy = "always".to_string();
        task.env = vec!["MODE=prod".to_string()];
        task.start_time = Some(Utc::now());
        task.container_id = Some("abc123".to_string());
        task
    }

    #[test]
    fn row_round_trip_is_field_for_field() {
        let store = SqliteStore::in_memory().unwrap();
        let task = sample();

        store.put(&task).unwrap();

        let back = store.get(&task.id).unwrap().unwrap();
        assert_eq!(back, task);
        assert_eq!(back.finish_time, None);
    }

    #[test]
    fn query_by_name_state_and_container() {
        let store = SqliteStore::in_memory().unwrap();
        let running = sample();
        let mut scheduled = Task::new("web", "nginx:latest");
        scheduled.state = State::Scheduled;
        store.put(&running).unwrap();
        store.put(&scheduled).unwrap();

        let hits = store
            .query(&TaskQuery::by_name_and_state("web", State::Scheduled))
            .unwrap();
        assert_eq!(hits, vec![scheduled]);

        let hits = store.query(&TaskQuery::by_container("abc123")).unwrap();
        assert_eq!(hits, vec![running]);

        assert_eq!(store.query(&TaskQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn query_orders_by_start_time_then_id() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let mut late = sample();
        late.name = "late".to_string();
        late.start_time = Some(now);
        let mut early = sample();
        early.name = "early".to_string();
        early.start_time = Some(now - chrono::Duration::seconds(5));
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
    fn reopening_a_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");
        let task = sample();

        SqliteStore::open(&path).unwrap().put(&task).unwrap();
        let reopened = SqliteStore::open(&path).unwrap();

        assert_eq!(reopened.get(&task.id).unwrap(), Some(task));
    }

    #[test]
    fn unknown_state_names_are_corrupt() {
        let store = SqliteStore::in_memory().unwrap();
        let task = sample();
        store.put(&task).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE tasks SET state = 'Bogus'", [])
            .unwrap();

        assert!(matches!(store.get(&task.id), Err(StoreError::Corrupt { .. })));
    }
}
