use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use super::{
    docker::ContainerRuntime,
    types::{ContainerConfig, ContainerInspect, ContainerStats, ContainerSummary, RuntimeError},
};

/// In-memory engine that records every call. `fail("start")` makes every
/// start fail, `fail("stop container-2")` only that container's stop.
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    containers: Mutex<Vec<ContainerSummary>>,
    failures: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, key: &str) {
        self.failures.lock().insert(key.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.containers.lock().clone()
    }

    pub fn add_container(&self, name: &str) -> String {
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.containers.lock().push(ContainerSummary {
            id: id.clone(),
            names: vec![format!("/{}", name)],
            image: "mock:latest".to_string(),
            status: "Up".to_string(),
            created: 0,
        });
        id
    }

    fn record(&self, op: &'static str, arg: &str) -> Result<(), RuntimeError> {
        self.record_with(op, arg, "")
    }

    /// `detail` lands in the call log but not in the failure key, so
    /// `fail("stop container-2")` still matches `stop container-2 t=0`.
    fn record_with(&self, op: &'static str, arg: &str, detail: &str) -> Result<(), RuntimeError> {
        let call = if arg.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, arg)
        };
        let logged = if detail.is_empty() {
            call.clone()
        } else {
            format!("{} {}", call, detail)
        };
        self.calls.lock().push(logged);

        let failures = self.failures.lock();
        if failures.contains(op) || failures.contains(&call) {
            return Err(RuntimeError::engine(
                match op {
                    "pull" => "image pull",
                    "create" => "container create",
                    "start" => "container start",
                    "stop" => "container stop",
                    "remove" => "container remove",
                    "list" => "container list",
                    "inspect" => "container inspect",
                    _ => "container stats",
                },
                "mock failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record("pull", image)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        self.record("create", &config.name)?;
        Ok(self.add_container(&config.name))
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.record("start", container_id)
    }

    fn stream_logs(&self, _container_id: &str) -> BoxStream<'static, Result<String, RuntimeError>> {
        stream::iter(vec![Ok("hello from mock".to_string())]).boxed()
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<ContainerInspect, RuntimeError> {
        self.record("inspect", container_id)?;
        Ok(ContainerInspect {
            id: container_id.to_string(),
            status: "running".to_string(),
            running: true,
            exit_code: None,
        })
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<i64>,
    ) -> Result<(), RuntimeError> {
        let detail = timeout.map(|t| format!("t={}", t)).unwrap_or_default();
        self.record_with("stop", container_id, &detail)
    }

    async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
        volumes: bool,
    ) -> Result<(), RuntimeError> {
        let detail = match (force, volumes) {
            (true, true) => "force volumes",
            (true, false) => "force",
            (false, true) => "volumes",
            (false, false) => "",
        };
        self.record_with("remove", container_id, detail)?;
        self.containers.lock().retain(|c| c.id != container_id);
        Ok(())
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record("list", "")?;
        Ok(self.containers())
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError> {
        self.record("stats", container_id)?;
        Ok(ContainerStats {
            cpu_total_usage: 1_000,
            memory_usage: 2_048,
            memory_limit: 4_096,
            ..Default::default()
        })
    }
}
