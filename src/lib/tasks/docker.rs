use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
    ContainerConfig, ContainerInspect, ContainerStats, ContainerSummary, DockerResult,
    RuntimeError,
};

/// The operations the worker and scheduler need from a container engine.
/// Every call is fallible; nothing here owns task data.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Returns the id of the created container.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Follows stdout and stderr of a container until it exits.
    fn stream_logs(&self, container_id: &str) -> BoxStream<'static, Result<String, RuntimeError>>;

    async fn inspect_container(&self, container_id: &str)
    -> Result<ContainerInspect, RuntimeError>;

    /// `timeout` is the grace period in seconds; `None` uses the engine default.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<i64>,
    ) -> Result<(), RuntimeError>;

    async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
        volumes: bool,
    ) -> Result<(), RuntimeError>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError>;
}

impl DockerResult {
    pub fn success(container_id: &str, action: &str, result: &str) -> Self {
        DockerResult {
            action: action.to_string(),
            container_id: Some(container_id.to_string()),
            result: result.to_string(),
            message: None,
        }
    }
}

/// Docker engine client. Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
    call_timeout: Duration,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connects using local defaults (`DOCKER_HOST` or the unix socket) and
    /// pings the engine so an unreachable daemon fails here, at startup.
    pub async fn connect(
        call_timeout: Duration,
        pull_timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;

        match tokio::time::timeout(call_timeout, client.ping()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(RuntimeError::Connect(e.to_string())),
            Err(_) => {
                return Err(RuntimeError::Connect(format!(
                    "ping timed out after {}s",
                    call_timeout.as_secs()
                )));
            }
        }

        Ok(DockerRuntime {
            client,
            call_timeout,
            pull_timeout,
        })
    }
}

async fn bounded<T, F>(op: &'static str, limit: Duration, call: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RuntimeError::engine(op, e)),
        Err(_) => Err(RuntimeError::Timeout {
            op,
            secs: limit.as_secs(),
        }),
    }
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

/// Without an explicit tag the engine would pull every tag of the repository.
fn with_default_tag(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || last_segment.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

pub fn short_id(container_id: &str) -> &str {
    container_id.get(..12).unwrap_or(container_id)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let reference = with_default_tag(image);
        let mut stream = Box::pin(self.client.create_image(
            Some(CreateImageOptions {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        ));

        let pull = async {
            while let Some(msg) = stream.next().await {
                let info = msg?;
                if let Some(status) = info.status {
                    debug!(image = %reference, %status, "pull progress");
                }
            }
            Ok::<(), bollard::errors::Error>(())
        };

        bounded("image pull", self.pull_timeout, pull).await
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let restart_policy = RestartPolicy {
            name: Some(restart_policy_name(&config.restart_policy)),
            maximum_retry_count: None,
        };

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = config
            .port_bindings
            .iter()
            .map(|(container_port, host_port)| {
                (
                    container_port.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.clone()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: (config.memory > 0).then_some(config.memory),
            nano_cpus: (config.cpus > 0.0).then(|| (config.cpus * 1_000_000_000.0) as i64),
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(false),
            ..Default::default()
        };

        let container_config = bollard::container::Config {
            image: Some(config.image.clone()),
            env: Some(config.env.clone()),
            exposed_ports: Some(
                config
                    .exposed_ports
                    .iter()
                    .map(|port| (port.clone(), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = (!config.name.is_empty()).then(|| CreateContainerOptions {
            name: config.name.clone(),
            ..Default::default()
        });

        let response = bounded(
            "container create",
            self.call_timeout,
            self.client.create_container(options, container_config),
        )
        .await?;

        for warning in &response.warnings {
            warn!(container_id = %short_id(&response.id), %warning, "engine warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        bounded(
            "container start",
            self.call_timeout,
            self.client
                .start_container(container_id, None::<StartContainerOptions<String>>),
        )
        .await
    }

    fn stream_logs(&self, container_id: &str) -> BoxStream<'static, Result<String, RuntimeError>> {
        self.client
            .logs(
                container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|chunk| {
                chunk
                    .map(|output| output.to_string())
                    .map_err(|e| RuntimeError::engine("container logs", e))
            })
            .boxed()
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<ContainerInspect, RuntimeError> {
        let response = bounded(
            "container inspect",
            self.call_timeout,
            self.client
                .inspect_container(container_id, None::<InspectContainerOptions>),
        )
        .await?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerInspect {
            id: response.id.unwrap_or_else(|| container_id.to_string()),
            status: state
                .status
                .map(|status| status.to_string())
                .unwrap_or_default(),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<i64>,
    ) -> Result<(), RuntimeError> {
        bounded(
            "container stop",
            self.call_timeout,
            self.client
                .stop_container(container_id, timeout.map(|t| StopContainerOptions { t })),
        )
        .await
    }

    async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
        volumes: bool,
    ) -> Result<(), RuntimeError> {
        bounded(
            "container remove",
            self.call_timeout,
            self.client.remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    v: volumes,
                    ..Default::default()
                }),
            ),
        )
        .await
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let containers = bounded(
            "container list",
            self.call_timeout,
            self.client.list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            })),
        )
        .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                    created: c.created.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError> {
        let mut stream = Box::pin(self.client.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        ));

        let stats = bounded("container stats", self.call_timeout, async {
            stream.next().await.transpose()
        })
        .await?
        .ok_or_else(|| RuntimeError::engine("container stats", "empty stats stream"))?;

        let (network_rx_bytes, network_tx_bytes) = stats
            .networks
            .unwrap_or_default()
            .values()
            .fold((0, 0), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes));

        Ok(ContainerStats {
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            memory_usage: stats.memory_stats.usage.unwrap_or_default(),
            memory_limit: stats.memory_stats.limit.unwrap_or_default(),
            network_rx_bytes,
            network_tx_bytes,
        })
    }
}

/// Pull, create and start a container for `config`. A container that was
/// created but failed to start is force-removed so it does not linger.
pub async fn run(
    runtime: &dyn ContainerRuntime,
    config: &ContainerConfig,
) -> Result<DockerResult, RuntimeError> {
    info!(image = %config.image, "pulling image");
    runtime.pull_image(&config.image).await?;

    let container_id = runtime.create_container(config).await?;
    info!(container_id = %short_id(&container_id), name = %config.name, "container created");

    if let Err(e) = runtime.start_container(&container_id).await {
        if let Err(cleanup) = runtime.remove_container(&container_id, true, true).await {
            warn!(
                container_id = %short_id(&container_id),
                error = %cleanup,
                "could not remove container that failed to start"
            );
        }
        return Err(e);
    }

    info!(container_id = %short_id(&container_id), "container started");
    Ok(DockerResult::success(&container_id, "start", "success"))
}

/// Graceful stop with the engine's default grace period, then remove.
pub async fn stop(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> Result<DockerResult, RuntimeError> {
    info!(container_id = %short_id(container_id), "stopping container");
    runtime.stop_container(container_id, None).await?;
    runtime.remove_container(container_id, false, false).await?;
    Ok(DockerResult::success(container_id, "stop", "success"))
}

/// Forwards container output to the log until the stream ends.
pub fn forward_logs(runtime: &dyn ContainerRuntime, container_id: &str) -> JoinHandle<()> {
    let mut logs = runtime.stream_logs(container_id);
    let container_id = short_id(container_id).to_string();

    tokio::spawn(async move {
        while let Some(line) = logs.next().await {
            match line {
                Ok(line) => {
                    info!(target: "cubelet::container", %container_id, "{}", line.trim_end())
                }
                Err(e) => {
                    warn!(%container_id, error = %e, "log stream ended");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::mock::MockRuntime;

    fn config() -> ContainerConfig {
        ContainerConfig {
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn untagged_images_default_to_latest() {
        assert_eq!(with_default_tag("nginx"), "nginx:latest");
        assert_eq!(with_default_tag("nginx:1.27"), "nginx:1.27");
        assert_eq!(with_default_tag("localhost:5000/app"), "localhost:5000/app:latest");
        assert_eq!(with_default_tag("repo/app@sha256:abc"), "repo/app@sha256:abc");
    }

    #[test]
    fn unknown_restart_policies_fall_back_to_no() {
        assert_eq!(restart_policy_name("always"), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(restart_policy_name("on-failure"), RestartPolicyNameEnum::ON_FAILURE);
        assert_eq!(restart_policy_name(""), RestartPolicyNameEnum::NO);
        assert_eq!(restart_policy_name("sometimes"), RestartPolicyNameEnum::NO);
    }

    #[tokio::test]
    async fn run_pulls_creates_and_starts() {
        let runtime = MockRuntime::new();

        let result = run(&runtime, &config()).await.unwrap();

        assert_eq!(result.action, "start");
        assert_eq!(result.container_id.as_deref(), Some("container-1"));
        assert_eq!(
            runtime.calls(),
            vec!["pull nginx:latest", "create web", "start container-1"]
        );
    }

    #[tokio::test]
    async fn failed_start_removes_the_created_container() {
        let runtime = MockRuntime::new();
        runtime.fail("start");

        let err = run(&runtime, &config()).await.unwrap_err();

        assert!(matches!(err, RuntimeError::Engine { op: "container start", .. }));
        assert_eq!(
            runtime.calls().last().map(String::as_str),
            Some("remove container-1 force volumes")
        );
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn pull_failure_stops_before_create() {
        let runtime = MockRuntime::new();
        runtime.fail("pull");

        assert!(run(&runtime, &config()).await.is_err());
        assert_eq!(runtime.calls(), vec!["pull nginx:latest"]);
    }

    #[tokio::test]
    async fn stop_then_remove() {
        let runtime = MockRuntime::new();
        let id = runtime.add_container("web");

        let result = stop(&runtime, &id).await.unwrap();

        assert_eq!(result.action, "stop");
        // Engine default grace period, no force, volumes kept.
        assert_eq!(runtime.calls(), vec![format!("stop {}", id), format!("remove {}", id)]);
        assert!(runtime.containers().is_empty());
    }
}
