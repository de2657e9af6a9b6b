use uuid::Uuid;

use crate::lib::tasks::types::{State, Task};

/// Persistence boundary for task records. Implementations must tolerate
/// concurrent readers; the worker is the only writer of a task while it
/// processes it.
pub trait Store: Send + Sync {
    fn get(&self, id: &Uuid) -> Result<Option<Task>, StoreError>;

    /// Insert or replace the record keyed by `task.id`.
    fn put(&self, task: &Task) -> Result<(), StoreError>;

    fn query(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Conjunctive predicate: every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub name: Option<String>,
    pub state: Option<State>,
    pub container_id: Option<String>,
}

impl TaskQuery {
    pub fn by_state(state: State) -> Self {
        TaskQuery {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn by_name_and_state(name: &str, state: State) -> Self {
        TaskQuery {
            name: Some(name.to_string()),
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn by_container(container_id: &str) -> Self {
        TaskQuery {
            container_id: Some(container_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.name.as_ref().is_none_or(|name| *name == task.name)
            && self.state.is_none_or(|state| state == task.state)
            && self
                .container_id
                .as_ref()
                .is_none_or(|id| task.container_id.as_ref() == Some(id))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open store: {0}")]
    Open(String),
}
