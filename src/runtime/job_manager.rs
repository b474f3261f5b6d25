//! The job manager actor.
//!
//! One tokio task owns every running job, its tasks and its checkpoint
//! coordinator, and works through a mailbox of [`JobManagerMessage`]s.
//! Requests carry a oneshot sender for the reply; tasks report acks,
//! declines and their termination through the same mailbox. Use a
//! [`JobManagerGateway`] to talk to it.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::instrument;

use super::coordinator::*;
use super::graph::*;
use super::restore::assign_state;
use super::task::*;
use crate::config::ClusterConfig;
use crate::config::RestartStrategy;
use crate::errors::Error;
use crate::errors::Result;
use crate::metrics::SharedMetricStore;
use crate::model::*;
use crate::storage::savepoint::dispose_savepoint;
use crate::storage::savepoint::load_metadata;
use crate::storage::CheckpointStorage;
use crate::storage::FileSystem;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything the job manager reacts to.
#[derive(Debug)]
pub enum JobManagerMessage {
    SubmitJob {
        graph: JobGraph,
        reply: Reply<JobId>,
    },
    /// Replies with the savepoint directory once the savepoint
    /// completed.
    TriggerSavepoint {
        job_id: JobId,
        target_directory: Option<PathBuf>,
        reply: Reply<PathBuf>,
    },
    /// Take a periodic checkpoint now. Replies with its directory once
    /// completed.
    TriggerCheckpoint {
        job_id: JobId,
        reply: Reply<PathBuf>,
    },
    RequestSavepoint {
        path: PathBuf,
        reply: Reply<CheckpointMetadata>,
    },
    DisposeSavepoint {
        path: PathBuf,
        reply: Reply<()>,
    },
    CancelJob {
        job_id: JobId,
        reply: Reply<()>,
    },
    RequestJobStatus {
        job_id: JobId,
        reply: Reply<JobStatus>,
    },
    /// Get a copy of every deployment descriptor of a job, including
    /// ones of later submissions with the same ID.
    RegisterDeploymentListener {
        job_id: JobId,
        listener: UnboundedSender<TaskDeploymentDescriptor>,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    PeriodicTrigger {
        job_id: JobId,
    },
    ExpireCheckpoint {
        job_id: JobId,
        checkpoint_id: CheckpointId,
    },
    RestartJob {
        job_id: JobId,
        attempt: u32,
    },
    Task(TaskEvent),
}

struct RunningJob {
    graph: JobGraph,
    status: JobStatus,
    attempt: u32,
    restarts: u32,
    tasks: Vec<StreamTask>,
    /// Tasks of the current attempt that haven't finished.
    unfinished: usize,
    coordinator: CheckpointCoordinator,
    periodic: Option<JoinHandle<()>>,
}

impl RunningJob {
    fn restart_strategy<'a>(&'a self, config: &'a ClusterConfig) -> &'a RestartStrategy {
        self.graph
            .restart_strategy
            .as_ref()
            .unwrap_or(&config.restart_strategy)
    }

    fn stop_periodic(&mut self) {
        if let Some(handle) = self.periodic.take() {
            handle.abort();
        }
    }
}

pub struct JobManager {
    config: Arc<ClusterConfig>,
    storage: CheckpointStorage,
    jobs: HashMap<JobId, RunningJob>,
    listeners: HashMap<JobId, Vec<UnboundedSender<TaskDeploymentDescriptor>>>,
    mailbox: UnboundedReceiver<JobManagerMessage>,
    self_tx: UnboundedSender<JobManagerMessage>,
    metrics: SharedMetricStore,
    runtime: Handle,
}

impl JobManager {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(
        config: Arc<ClusterConfig>,
        fs: Arc<dyn FileSystem>,
        metrics: SharedMetricStore,
    ) -> (JobManagerGateway, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let storage = CheckpointStorage::new(
            fs,
            config.checkpoint_dir.clone(),
            config.savepoint_dir.clone(),
        );
        let gateway = JobManagerGateway {
            tx: tx.clone(),
            ask_timeout: config.ask_timeout,
        };
        let actor = Self {
            config,
            storage,
            jobs: HashMap::new(),
            listeners: HashMap::new(),
            mailbox: rx,
            self_tx: tx,
            metrics,
            runtime: Handle::current(),
        };
        let handle = tokio::spawn(actor.run());
        (gateway, handle)
    }

    async fn run(mut self) {
        tracing::info!("Job manager started");
        while let Some(msg) = self.mailbox.recv().await {
            if let JobManagerMessage::Shutdown { reply } = msg {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
                break;
            }
            self.handle(msg).await;
        }
        tracing::info!("Job manager stopped");
    }

    fn fs(&self) -> &dyn FileSystem {
        self.storage.fs().as_ref()
    }

    async fn handle(&mut self, msg: JobManagerMessage) {
        match msg {
            JobManagerMessage::SubmitJob { graph, reply } => {
                let res = self.submit_job(graph);
                let _ = reply.send(res);
            }
            JobManagerMessage::TriggerSavepoint {
                job_id,
                target_directory,
                reply,
            } => self.trigger(job_id, true, target_directory, reply),
            JobManagerMessage::TriggerCheckpoint { job_id, reply } => {
                self.trigger(job_id, false, None, reply)
            }
            JobManagerMessage::RequestSavepoint { path, reply } => {
                let _ = reply.send(load_metadata(self.fs(), &path));
            }
            JobManagerMessage::DisposeSavepoint { path, reply } => {
                let _ = reply.send(dispose_savepoint(self.fs(), &path));
            }
            JobManagerMessage::CancelJob { job_id, reply } => {
                let res = self.cancel_job(job_id).await;
                let _ = reply.send(res);
            }
            JobManagerMessage::RequestJobStatus { job_id, reply } => {
                let res = self
                    .jobs
                    .get(&job_id)
                    .map(|job| job.status)
                    .ok_or(Error::JobNotFound(job_id));
                let _ = reply.send(res);
            }
            JobManagerMessage::RegisterDeploymentListener {
                job_id,
                listener,
                reply,
            } => {
                self.listeners.entry(job_id).or_default().push(listener);
                let _ = reply.send(Ok(()));
            }
            JobManagerMessage::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
            JobManagerMessage::PeriodicTrigger { job_id } => self.periodic_trigger(job_id),
            JobManagerMessage::ExpireCheckpoint {
                job_id,
                checkpoint_id,
            } => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.coordinator.expire(checkpoint_id);
                    if job.status == JobStatus::Running
                        && job.coordinator.failure_threshold_exceeded()
                    {
                        self.fail_job(job_id, "too many failed checkpoints".to_owned())
                            .await;
                    }
                }
            }
            JobManagerMessage::RestartJob { job_id, attempt } => self.restart_job(job_id, attempt),
            JobManagerMessage::Task(event) => self.handle_task_event(event).await,
        }
    }

    /// Deploy every subtask of a job from the given restored state.
    fn deploy(
        &mut self,
        graph: &JobGraph,
        attempt: u32,
        restore: HashMap<(OperatorId, SubtaskIndex), TaskStateHandles>,
    ) -> Result<Vec<StreamTask>> {
        let env = TaskEnvironment {
            fs: self.storage.fs().clone(),
            config: self.config.clone(),
            job_manager: self.self_tx.clone(),
            runtime: self.runtime.clone(),
            metrics: self.metrics.clone(),
        };
        let tdds = deployment_descriptors(graph.job_id, &graph.vertices, attempt, restore);
        if let Some(listeners) = self.listeners.get_mut(&graph.job_id) {
            listeners.retain(|listener| tdds.iter().all(|tdd| listener.send(tdd.clone()).is_ok()));
        }
        let mut tasks = Vec::with_capacity(tdds.len());
        for tdd in tdds {
            let Some(vertex) = graph.vertex(tdd.operator_id) else {
                continue;
            };
            match StreamTask::deploy(tdd, vertex.clone(), env.clone()) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    for task in &tasks {
                        task.cancel();
                    }
                    return Err(err);
                }
            }
        }
        Ok(tasks)
    }

    /// Restored state for `graph` out of the checkpoint or savepoint at
    /// `path`.
    fn restore_from_path(
        &self,
        graph: &JobGraph,
    ) -> Result<HashMap<(OperatorId, SubtaskIndex), TaskStateHandles>> {
        match &graph.restore_settings {
            Some(settings) => {
                let metadata = load_metadata(self.fs(), &settings.path)?;
                tracing::info!(
                    "Restoring job {} from {} {} at {:?}",
                    graph.job_id,
                    metadata.kind,
                    metadata.checkpoint_id,
                    settings.path
                );
                assign_state(
                    graph,
                    &metadata,
                    settings.allow_non_restored_state,
                    self.fs(),
                )
            }
            None => Ok(HashMap::new()),
        }
    }

    /// Everything that can reject a job before any task is deployed.
    fn prepare_submission(
        &self,
        graph: &JobGraph,
    ) -> Result<HashMap<(OperatorId, SubtaskIndex), TaskStateHandles>> {
        if self
            .jobs
            .get(&graph.job_id)
            .is_some_and(|job| !job.status.is_terminal())
        {
            return Err(Error::Config(format!(
                "job {} is already running",
                graph.job_id
            )));
        }
        graph.validate()?;
        self.restore_from_path(graph)
    }

    #[instrument(skip_all, fields(job_id = %graph.job_id, name = %graph.name))]
    fn submit_job(&mut self, graph: JobGraph) -> Result<JobId> {
        let job_id = graph.job_id;
        let restore = self
            .prepare_submission(&graph)
            .map_err(|err| Error::JobSubmission {
                source: Box::new(err),
            })?;

        // A resubmitted job starts its metrics over.
        match self.metrics.write() {
            Ok(mut store) => store.remove_job(job_id),
            Err(_) => tracing::warn!("Metric store lock poisoned"),
        }

        let settings = graph
            .checkpointing
            .clone()
            .unwrap_or_else(|| self.config.checkpointing.clone());
        let mut coordinator = CheckpointCoordinator::new(
            job_id,
            settings,
            self.storage.clone(),
            vertex_shapes(&graph.vertices),
        );
        let tasks = self
            .deploy(&graph, 0, restore)
            .map_err(|err| Error::JobSubmission {
                source: Box::new(err),
            })?;
        coordinator.set_tasks(gateways(&tasks));

        let mut job = RunningJob {
            unfinished: tasks.len(),
            graph,
            status: JobStatus::Running,
            attempt: 0,
            restarts: 0,
            tasks,
            coordinator,
            periodic: None,
        };
        job.periodic = self.start_periodic(job_id, &job.coordinator);
        self.jobs.insert(job_id, job);
        tracing::info!("Job {job_id} running");
        Ok(job_id)
    }

    fn start_periodic(
        &self,
        job_id: JobId,
        coordinator: &CheckpointCoordinator,
    ) -> Option<JoinHandle<()>> {
        let interval = coordinator.settings().interval?;
        let tx = self.self_tx.clone();
        Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            // The first tick is immediate; let tasks start first.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if tx.send(JobManagerMessage::PeriodicTrigger { job_id }).is_err() {
                    break;
                }
            }
        }))
    }

    fn schedule_expiry(&self, job_id: JobId, checkpoint_id: CheckpointId, timeout: Duration) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(JobManagerMessage::ExpireCheckpoint {
                job_id,
                checkpoint_id,
            });
        });
    }

    fn trigger(
        &mut self,
        job_id: JobId,
        is_savepoint: bool,
        target_directory: Option<PathBuf>,
        reply: Reply<PathBuf>,
    ) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            let _ = reply.send(Err(Error::JobNotFound(job_id)));
            return;
        };
        if job.status != JobStatus::Running {
            let _ = reply.send(Err(Error::JobNotRunning(job_id)));
            return;
        }
        match job
            .coordinator
            .trigger_checkpoint(Utc::now(), is_savepoint, target_directory.as_deref())
        {
            Ok(checkpoint_id) => {
                job.coordinator.on_completion(checkpoint_id, reply);
                let timeout = job.coordinator.settings().timeout;
                self.schedule_expiry(job_id, checkpoint_id, timeout);
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn periodic_trigger(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.status != JobStatus::Running {
            return;
        }
        match job.coordinator.trigger_checkpoint(Utc::now(), false, None) {
            Ok(checkpoint_id) => {
                let timeout = job.coordinator.settings().timeout;
                self.schedule_expiry(job_id, checkpoint_id, timeout);
            }
            Err(err) => tracing::debug!("Skipping periodic checkpoint of job {job_id}: {err}"),
        }
    }

    /// Stop the tasks of a job and wait until they are gone.
    async fn stop_tasks(tasks: Vec<StreamTask>) {
        for task in &tasks {
            task.cancel();
        }
        let joined = tokio::task::spawn_blocking(move || {
            for task in &tasks {
                task.wait_for_termination();
            }
        })
        .await;
        if let Err(err) = joined {
            tracing::error!("Error waiting for tasks to stop: {err}");
        }
    }

    #[instrument(skip(self))]
    async fn cancel_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.stop_periodic();
        job.status = JobStatus::Canceled;
        let tasks = std::mem::take(&mut job.tasks);
        Self::stop_tasks(tasks).await;
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.coordinator.shutdown();
        }
        tracing::info!("Job {job_id} canceled");
        Ok(())
    }

    async fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Acknowledge(ack) => match self.jobs.get_mut(&ack.job_id) {
                Some(job) => {
                    job.coordinator.receive_acknowledge(ack);
                }
                None => tracing::warn!("Ack for unknown job {}", ack.job_id),
            },
            TaskEvent::Decline(decline) => {
                let job_id = decline.job_id;
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    return;
                };
                job.coordinator.receive_decline(decline);
                if job.status == JobStatus::Running && job.coordinator.failure_threshold_exceeded()
                {
                    self.fail_job(job_id, "too many failed checkpoints".to_owned())
                        .await;
                }
            }
            TaskEvent::Finished {
                job_id, attempt, ..
            } => {
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    return;
                };
                if attempt != job.attempt || job.status != JobStatus::Running {
                    return;
                }
                job.unfinished = job.unfinished.saturating_sub(1);
                if job.unfinished == 0 {
                    job.stop_periodic();
                    job.status = JobStatus::Finished;
                    let tasks = std::mem::take(&mut job.tasks);
                    Self::stop_tasks(tasks).await;
                    if let Some(job) = self.jobs.get_mut(&job_id) {
                        job.coordinator.shutdown();
                    }
                    tracing::info!("Job {job_id} finished");
                }
            }
            TaskEvent::Failed {
                job_id,
                operator_id,
                subtask_index,
                attempt,
                error,
            } => {
                let current = self
                    .jobs
                    .get(&job_id)
                    .is_some_and(|job| job.attempt == attempt && job.status == JobStatus::Running);
                if current {
                    self.fail_job(
                        job_id,
                        format!("task {operator_id}/{subtask_index} failed: {error}"),
                    )
                    .await;
                }
            }
        }
    }

    /// Tear down the current attempt and restart or fail for good.
    async fn fail_job(&mut self, job_id: JobId, reason: String) {
        let config = self.config.clone();
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        tracing::warn!("Job {job_id} failed: {reason}");
        job.stop_periodic();
        let tasks = std::mem::take(&mut job.tasks);
        Self::stop_tasks(tasks).await;

        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.coordinator.abort_all_pending("job failed");
        match job.restart_strategy(&config).clone() {
            RestartStrategy::FixedDelay { attempts, delay } if job.restarts < attempts => {
                job.restarts += 1;
                job.status = JobStatus::Restarting;
                let attempt = job.attempt;
                tracing::info!(
                    "Restarting job {job_id} in {delay:?} (restart {} of {attempts})",
                    job.restarts
                );
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(JobManagerMessage::RestartJob { job_id, attempt });
                });
            }
            _ => {
                job.status = JobStatus::Failed;
                job.coordinator.shutdown();
                tracing::error!("Job {job_id} failed for good");
            }
        }
    }

    /// Redeploy from the latest completed checkpoint, or from what the
    /// job was originally submitted with.
    #[instrument(skip(self))]
    fn restart_job(&mut self, job_id: JobId, attempt: u32) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if job.status != JobStatus::Restarting || job.attempt != attempt {
            return;
        }
        let graph = job.graph.clone();
        let restore = match job.coordinator.latest_completed() {
            Some(checkpoint) => {
                tracing::info!(
                    "Restoring job {job_id} from checkpoint {}",
                    checkpoint.checkpoint_id()
                );
                assign_state(&graph, &checkpoint.metadata, false, self.fs())
            }
            None => self.restore_from_path(&graph),
        };
        let next_attempt = attempt + 1;
        let deployed = restore.and_then(|restore| self.deploy(&graph, next_attempt, restore));

        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        match deployed {
            Ok(tasks) => {
                job.attempt = next_attempt;
                job.unfinished = tasks.len();
                job.coordinator.set_tasks(gateways(&tasks));
                job.tasks = tasks;
                job.status = JobStatus::Running;
                let periodic = self.start_periodic(job_id, &self.jobs[&job_id].coordinator);
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.periodic = periodic;
                }
            }
            Err(err) => {
                tracing::error!("Error restarting job {job_id}: {err}");
                job.status = JobStatus::Failed;
                job.coordinator.shutdown();
            }
        }
    }

    async fn shutdown(&mut self) {
        let running: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| !job.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for job_id in running {
            if let Err(err) = self.cancel_job(job_id).await {
                tracing::warn!("Error canceling job {job_id} on shutdown: {err}");
            }
        }
    }
}

fn gateways(tasks: &[StreamTask]) -> Vec<Arc<dyn TaskGateway>> {
    tasks
        .iter()
        .map(|task| Arc::new(task.clone()) as Arc<dyn TaskGateway>)
        .collect()
}

/// Talks to a [`JobManager`]. Every request gives up after a timeout.
#[derive(Debug, Clone)]
pub struct JobManagerGateway {
    tx: UnboundedSender<JobManagerMessage>,
    ask_timeout: Duration,
}

impl JobManagerGateway {
    pub fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }

    /// Send a request and wait for its reply.
    pub async fn ask<T>(
        &self,
        timeout: Duration,
        request: impl FnOnce(Reply<T>) -> JobManagerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(request(tx))
            .map_err(|_| Error::Disconnected)?;
        with_timeout(timeout, rx).await?
    }

    pub async fn submit_job(&self, graph: JobGraph) -> Result<JobId> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::SubmitJob {
            graph,
            reply,
        })
        .await
    }

    /// Take a savepoint and wait until it is complete.
    ///
    /// Returns the savepoint directory.
    pub async fn trigger_savepoint(
        &self,
        job_id: JobId,
        target_directory: Option<PathBuf>,
    ) -> Result<PathBuf> {
        self.ask(self.ask_timeout, |reply| {
            JobManagerMessage::TriggerSavepoint {
                job_id,
                target_directory,
                reply,
            }
        })
        .await
    }

    /// Take a periodic checkpoint now and wait until it is complete.
    pub async fn trigger_checkpoint(&self, job_id: JobId) -> Result<PathBuf> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::TriggerCheckpoint {
            job_id,
            reply,
        })
        .await
    }

    pub async fn request_savepoint(&self, path: PathBuf) -> Result<CheckpointMetadata> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::RequestSavepoint {
            path,
            reply,
        })
        .await
    }

    pub async fn dispose_savepoint(&self, path: PathBuf) -> Result<()> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::DisposeSavepoint {
            path,
            reply,
        })
        .await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::CancelJob {
            job_id,
            reply,
        })
        .await
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::RequestJobStatus {
            job_id,
            reply,
        })
        .await
    }

    /// Poll the status of a job until `done` says so.
    pub async fn wait_for_status(
        &self,
        job_id: JobId,
        done: impl Fn(JobStatus) -> bool,
    ) -> Result<JobStatus> {
        let poll = async {
            loop {
                let status = self.job_status(job_id).await?;
                if done(status) {
                    return Ok(status);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(self.ask_timeout, poll)
            .await
            .unwrap_or(Err(Error::AskTimeout(self.ask_timeout)))
    }

    pub async fn register_deployment_listener(
        &self,
        job_id: JobId,
    ) -> Result<UnboundedReceiver<TaskDeploymentDescriptor>> {
        let (listener, rx) = mpsc::unbounded_channel();
        self.ask(self.ask_timeout, |reply| {
            JobManagerMessage::RegisterDeploymentListener {
                job_id,
                listener,
                reply,
            }
        })
        .await?;
        Ok(rx)
    }

    /// Cancel all jobs and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.ask(self.ask_timeout, |reply| JobManagerMessage::Shutdown { reply })
            .await
    }
}

async fn with_timeout<T, E>(
    timeout: Duration,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(Error::Disconnected),
        Err(_) => Err(Error::AskTimeout(timeout)),
    }
}
