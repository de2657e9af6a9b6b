use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl State {
    pub const ALL: [State; 6] = [
        State::Pending,
        State::Scheduled,
        State::Running,
        State::Completed,
        State::Failed,
        State::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "Pending",
            State::Scheduled => "Scheduled",
            State::Running => "Running",
            State::Completed => "Completed",
            State::Failed => "Failed",
            State::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state: {0}")]
pub struct UnknownState(pub String);

/// The durable unit of work. `memory` is in MiB, `cpus` in whole CPUs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: Uuid,
    pub container_id: Option<String>,
    pub name: String,
    pub state: State,
    pub image: String,
    pub memory: i64,
    pub disk: i64,
    pub cpus: f64,
    pub exposed_ports: Vec<u16>,
    pub port_bindings: HashMap<String, String>,
    pub restart_policy: String,
    pub env: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

const MIB: i64 = 1024 * 1024;

/// Beyond this the nano-CPU value handed to the engine stops being meaningful.
pub const MAX_CPUS: f64 = 1024.0;

impl Task {
    pub fn new(name: &str, image: &str) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// A stop request only carries the id; the worker recovers the rest
    /// from the store.
    pub fn stop_request(id: Uuid) -> Self {
        Task {
            id,
            state: State::Completed,
            ..Default::default()
        }
    }

    /// Rejects limits the engine cannot represent.
    pub fn check_resources(&self) -> Result<(), String> {
        if self.memory < 0 || self.memory.checked_mul(MIB).is_none() {
            return Err(format!(
                "memory must be between 0 and {} MiB, got {}",
                i64::MAX / MIB,
                self.memory
            ));
        }
        if self.disk < 0 {
            return Err(format!("disk must not be negative, got {}", self.disk));
        }
        if !self.cpus.is_finite() || !(0.0..=MAX_CPUS).contains(&self.cpus) {
            return Err(format!("cpus must be between 0 and {}, got {}", MAX_CPUS, self.cpus));
        }
        Ok(())
    }
}

/// Everything the runtime needs to create a container for a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    /// Bytes.
    pub memory: i64,
    pub disk: i64,
    pub cpus: f64,
    /// `<port>/<proto>` keys.
    pub exposed_ports: Vec<String>,
    /// `<port>/<proto>` -> host port.
    pub port_bindings: HashMap<String, String>,
    pub restart_policy: String,
}

pub fn new_config(task: &Task) -> Result<ContainerConfig, RuntimeError> {
    task.check_resources().map_err(RuntimeError::InvalidConfig)?;
    let memory = task
        .memory
        .checked_mul(MIB)
        .ok_or_else(|| RuntimeError::InvalidConfig(format!("memory overflow: {} MiB", task.memory)))?;

    let port_bindings: HashMap<String, String> = task
        .port_bindings
        .iter()
        .map(|(container_port, host_port)| (port_key(container_port), host_port.clone()))
        .collect();

    let exposed_ports: BTreeSet<String> = task
        .exposed_ports
        .iter()
        .map(|port| port_key(&port.to_string()))
        .chain(port_bindings.keys().cloned())
        .collect();

    Ok(ContainerConfig {
        name: task.name.clone(),
        image: task.image.clone(),
        env: task.env.clone(),
        memory,
        disk: task.disk,
        cpus: task.cpus,
        exposed_ports: exposed_ports.into_iter().collect(),
        port_bindings,
        restart_policy: task.restart_policy.clone(),
    })
}

fn port_key(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{}/tcp", port)
    }
}

/// Outcome of a successful container action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DockerResult {
    pub action: String,
    pub container_id: Option<String>,
    pub result: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub status: String,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInspect {
    pub id: String,
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub cpu_total_usage: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot reach container engine: {0}")]
    Connect(String),

    #[error("{op} failed: {reason}")]
    Engine { op: &'static str, reason: String },

    #[error("invalid container config: {0}")]
    InvalidConfig(String),

    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
}

impl RuntimeError {
    pub fn engine(op: &'static str, err: impl fmt::Display) -> Self {
        RuntimeError::Engine {
            op,
            reason: err.to_string(),
        }
    }
}
