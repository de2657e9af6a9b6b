use std::{sync::Arc, time::Duration};

use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::types::{ContainerReport, Scheduler};
use crate::lib::tasks::{docker::{ContainerRuntime, short_id}, types::RuntimeError};

impl Scheduler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, interval: Duration) -> Self {
        Scheduler { runtime, interval }
    }

    /// One pass over the running containers with a stats snapshot each.
    pub async fn poll_once(&self) -> Result<Vec<ContainerReport>, RuntimeError> {
        let containers = self.runtime.list_containers(false).await?;
        let mut reports = Vec::with_capacity(containers.len());

        for summary in containers {
            let stats = match self.runtime.stats(&summary.id).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(container_id = %short_id(&summary.id), error = %e, "failed to get container stats");
                    None
                }
            };
            reports.push(ContainerReport { summary, stats });
        }

        Ok(reports)
    }

    /// Poll forever. The first pass happens one interval after start.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "scheduler polling containers");
        let mut ticker = interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(reports) => {
                    info!(running = reports.len(), "polled containers");
                    for report in &reports {
                        match &report.stats {
                            Some(stats) => debug!(
                                container_id = %short_id(&report.summary.id),
                                image = %report.summary.image,
                                status = %report.summary.status,
                                memory_usage = stats.memory_usage,
                                memory_limit = stats.memory_limit,
                                cpu_total_usage = stats.cpu_total_usage,
                                "container stats"
                            ),
                            None => debug!(
                                container_id = %short_id(&report.summary.id),
                                status = %report.summary.status,
                                "container without stats"
                            ),
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to list containers"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::mock::MockRuntime;

    #[tokio::test]
    async fn poll_reports_every_running_container() {
        let runtime = Arc::new(MockRuntime::new());
        let first = runtime.add_container("web");
        let second = runtime.add_container("db");
        let scheduler = Scheduler::new(runtime.clone(), Duration::from_secs(10));

        let reports = scheduler.poll_once().await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.stats.is_some()));
        assert_eq!(
            runtime.calls(),
            vec![
                "list".to_string(),
                format!("stats {}", first),
                format!("stats {}", second),
            ]
        );
    }

    #[tokio::test]
    async fn stats_failure_keeps_the_container_in_the_report() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container("web");
        let broken = runtime.add_container("db");
        runtime.fail(&format!("stats {}", broken));
        let scheduler = Scheduler::new(runtime, Duration::from_secs(10));

        let reports = scheduler.poll_once().await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports[0].stats.is_some());
        assert_eq!(reports[1].summary.id, broken);
        assert!(reports[1].stats.is_none());
    }

    #[tokio::test]
    async fn list_failure_is_returned() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail("list");
        let scheduler = Scheduler::new(runtime, Duration::from_secs(10));

        assert!(scheduler.poll_once().await.is_err());
    }
}
