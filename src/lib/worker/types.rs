use std::{
    collections::VecDeque,
    sync::{Arc, atomic::{AtomicBool, AtomicU64}},
};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::lib::{
    store::types::{Store, StoreError},
    tasks::{
        docker::ContainerRuntime,
        types::{RuntimeError, State, Task},
    },
};

/// Owns the FIFO of requested task records and drives them, one at a time,
/// through the store and the container runtime.
pub struct Worker {
    pub name: String,
    pub(super) queue: Mutex<VecDeque<Task>>,
    pub(super) store: Arc<dyn Store>,
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    pub(super) task_count: AtomicU64,
    /// Held for the whole of one `run_task` and for the shutdown sweep.
    pub(super) run_lock: tokio::sync::Mutex<()>,
    pub(super) closed: AtomicBool,
}

/// Host snapshot served on `/stats`. Memory figures are bytes here and
/// rendered in MB when serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub hostname: String,
    pub os: String,
    pub uptime_secs: u64,
    pub load_one: f64,
    pub cpu_count: usize,
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub disk_percent: f32,
    pub tasks_processed: u64,
    pub queue_length: usize,
}

pub struct TaskServer {
    pub worker: Arc<Worker>,
    pub address: String,
    pub port: u16,
}

/// Result of the shutdown sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no task found running with the given id: {0}")]
    NoTaskFound(Uuid),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },

    #[error("task {0} has no container bound")]
    NoContainer(Uuid),

    #[error("task should not be run in this state: {0}")]
    InvalidState(State),

    #[error("runtime error: {source}")]
    Runtime {
        source: RuntimeError,
        hint: Option<String>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Operator-facing advice, set when a failure may have left a container behind.
    pub fn hint(&self) -> Option<&str> {
        match self {
            WorkerError::Runtime { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

impl From<RuntimeError> for WorkerError {
    fn from(source: RuntimeError) -> Self {
        WorkerError::Runtime { source, hint: None }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
