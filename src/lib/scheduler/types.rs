use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::lib::tasks::{
    docker::ContainerRuntime,
    types::{ContainerStats, ContainerSummary},
};

/// Periodically looks at what the engine is actually running. It only
/// reports; reconciling task records happens in the worker.
pub struct Scheduler {
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    pub(super) interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerReport {
    pub summary: ContainerSummary,
    /// `None` when the engine refused a stats snapshot for this container.
    pub stats: Option<ContainerStats>,
}
