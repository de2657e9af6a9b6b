use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::types::{SweepReport, Worker, WorkerError, WorkerResult};
use crate::lib::{
    store::types::{Store, TaskQuery},
    tasks::{
        docker::{self, ContainerRuntime, short_id},
        state::valid_state_transition,
        types::{DockerResult, State, Task, new_config},
    },
};

impl Worker {
    pub fn new(name: &str, store: Arc<dyn Store>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Worker {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            store,
            runtime,
            task_count: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of records taken off the queue so far.
    pub fn processed_count(&self) -> u64 {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Re-enqueue every persisted `Scheduled` task. These were accepted
    /// before a restart but never reached the runtime.
    pub fn recover(&self) -> WorkerResult<usize> {
        let pending = self.store.query(&TaskQuery::by_state(State::Scheduled))?;
        let count = pending.len();
        for task in pending {
            info!(task_id = %task.id, name = %task.name, "re-queueing scheduled task");
            self.add_task(task);
        }
        Ok(count)
    }

    /// Enqueue without validation; the transition is checked at dequeue
    /// time against what the store holds then.
    pub fn add_task(&self, task: Task) {
        if self.is_closed() {
            warn!(task_id = %task.id, "worker is shutting down, task will not be processed");
        }
        debug!(task_id = %task.id, state = %task.state, "task queued");
        self.queue.lock().push_back(task);
    }

    /// Process the head of the queue. `Ok(None)` means there was nothing to do.
    pub async fn run_task(&self) -> WorkerResult<Option<DockerResult>> {
        let _running = self.run_lock.lock().await;
        if self.is_closed() {
            return Ok(None);
        }

        let Some(queued) = self.queue.lock().pop_front() else {
            debug!("no tasks in queue");
            return Ok(None);
        };
        self.task_count.fetch_add(1, Ordering::SeqCst);

        let persisted = match self.store.get(&queued.id)? {
            Some(task) => task,
            None if queued.state == State::Completed => {
                warn!(task_id = %queued.id, "stop requested for unknown task");
                return Err(WorkerError::NoTaskFound(queued.id));
            }
            None => {
                info!(task_id = %queued.id, "no entry found, treating as a new task");
                self.persist(&queued);
                queued.clone()
            }
        };

        if !valid_state_transition(&persisted.state, &queued.state) {
            warn!(
                task_id = %queued.id,
                from = %persisted.state,
                to = %queued.state,
                "invalid state transition"
            );
            return Err(WorkerError::InvalidTransition {
                from: persisted.state,
                to: queued.state,
            });
        }

        let mut task = queued;
        let result = match task.state {
            State::Scheduled => self.start_task(&mut task).await,
            State::Completed => self.stop_task(&mut task).await,
            state => {
                warn!(task_id = %task.id, %state, "task should not be run in this state");
                return Err(WorkerError::InvalidState(state));
            }
        };

        self.persist(&task);
        result.map(Some)
    }

    /// Create and start the container for `task`. On success the task is
    /// `Running` with its container id bound; on failure it is `Failed`.
    /// The caller persists the outcome either way.
    pub async fn start_task(&self, task: &mut Task) -> WorkerResult<DockerResult> {
        task.start_time = Some(Utc::now());
        let outcome = match new_config(task) {
            Ok(config) => docker::run(self.runtime.as_ref(), &config).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                task.container_id = result.container_id.clone();
                task.state = State::Running;
                task.message = None;

                if let Some(container_id) = &result.container_id {
                    info!(
                        task_id = %task.id,
                        container_id = %short_id(container_id),
                        "task started"
                    );
                    self.report_container(container_id).await;
                    docker::forward_logs(self.runtime.as_ref(), container_id);
                }
                Ok(result)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "error running task");
                task.state = State::Failed;
                task.message = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Stop and remove the container bound to the persisted record of
    /// `task.id`. `task` is replaced by that record so the caller persists
    /// the full row, not just the request.
    pub async fn stop_task(&self, task: &mut Task) -> WorkerResult<DockerResult> {
        let Some(persisted) = self.store.get(&task.id)? else {
            warn!(task_id = %task.id, "no task found running with the given id");
            return Err(WorkerError::NoTaskFound(task.id));
        };
        *task = persisted;

        let Some(container_id) = task.container_id.clone() else {
            warn!(task_id = %task.id, state = %task.state, "task has no container bound");
            return Err(WorkerError::NoContainer(task.id));
        };

        match docker::stop(self.runtime.as_ref(), &container_id).await {
            Ok(result) => {
                let now = Utc::now();
                task.finish_time = Some(now);
                task.end_time = Some(now);
                task.state = State::Completed;
                task.message = None;
                info!(
                    task_id = %task.id,
                    container_id = %short_id(&container_id),
                    "stopped and removed container"
                );
                Ok(result)
            }
            Err(e) => {
                let hint = format!(
                    "container {} may still exist; stop and remove it manually",
                    short_id(&container_id)
                );
                error!(task_id = %task.id, error = %e, %hint, "error stopping task");
                task.message = Some(format!("{}: {}", e, hint));
                Err(WorkerError::Runtime {
                    source: e,
                    hint: Some(hint),
                })
            }
        }
    }

    /// Force-stop and remove every running container the engine knows
    /// about, including ones this process never queued, and mark their
    /// tasks `Stopped`. One container failing does not stop the others;
    /// failing to list containers at all is returned as an error.
    pub async fn stop_all_tasks(&self) -> WorkerResult<SweepReport> {
        self.closed.store(true, Ordering::SeqCst);
        let _running = self.run_lock.lock().await;

        let containers = self.runtime.list_containers(false).await?;
        let mut report = SweepReport::default();

        for container in containers {
            let id = container.id;
            info!(container_id = %short_id(&id), "stopping container");

            if let Err(e) = self.runtime.stop_container(&id, Some(0)).await {
                warn!(container_id = %short_id(&id), error = %e, "could not stop container");
                report.failed.push((id, e.to_string()));
                continue;
            }
            if let Err(e) = self.runtime.remove_container(&id, true, true).await {
                warn!(container_id = %short_id(&id), error = %e, "could not remove container");
                report.failed.push((id, e.to_string()));
                continue;
            }

            self.mark_stopped(&id);
            report.stopped.push(id);
        }

        Ok(report)
    }

    fn mark_stopped(&self, container_id: &str) {
        let tasks = match self.store.query(&TaskQuery::by_container(container_id)) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(container_id = %short_id(container_id), error = %e, "failed to look up task");
                return;
            }
        };

        if tasks.is_empty() {
            debug!(container_id = %short_id(container_id), "container has no task record");
        }
        for mut task in tasks {
            task.state = State::Stopped;
            task.end_time = Some(Utc::now());
            task.message = Some("container stopped at shutdown".to_string());
            self.persist(&task);
        }
    }

    async fn report_container(&self, container_id: &str) {
        match self.runtime.inspect_container(container_id).await {
            Ok(inspect) => debug!(
                container_id = %short_id(container_id),
                status = %inspect.status,
                running = inspect.running,
                "container inspected"
            ),
            Err(e) => warn!(container_id = %short_id(container_id), error = %e, "inspect failed"),
        }
    }

    /// Persistence failures are logged, not propagated: a container that
    /// is already running is not rolled back because its row failed to save.
    fn persist(&self, task: &Task) {
        if let Err(e) = self.store.put(task) {
            error!(task_id = %task.id, state = %task.state, error = %e, "failed to persist task");
        }
    }
}

/// Drain the queue forever, sleeping `idle` whenever it is empty. Returns
/// once the worker has been closed by the shutdown sweep.
pub async fn run_tasks(worker: Arc<Worker>, idle: Duration) {
    info!(worker = %worker.name, "worker listening to its queue");
    while !worker.is_closed() {
        if worker.queue_len() == 0 {
            debug!("no tasks to process currently");
            tokio::time::sleep(idle).await;
            continue;
        }

        match worker.run_task().await {
            Ok(Some(result)) => info!(
                action = %result.action,
                container_id = result.container_id.as_deref().map(short_id).unwrap_or(""),
                "task processed"
            ),
            Ok(None) => {}
            Err(e) => match e.hint() {
                Some(hint) => error!(error = %e, %hint, "error running task"),
                None => error!(error = %e, "error running task"),
            },
        }
    }
    info!(worker = %worker.name, "worker stopped");
}
