//! One running subtask.
//!
//! A [`StreamTask`] owns its source, its operator chain and its keyed
//! state backend, all behind one mutex: the checkpoint lock. The task
//! thread holds it while polling the source and pushing a record
//! through the chain; a checkpoint holds it while taking the
//! synchronous part of the snapshot. Writing the snapshot out happens
//! after the lock is released, on the blocking pool.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Duration;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use super::coordinator::*;
use super::graph::JobVertex;
use super::job_manager::JobManagerMessage;
use super::operator::*;
use crate::config::ClusterConfig;
use crate::errors::prepend_tname;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::ResultExt;
use crate::metrics::SharedMetricStore;
use crate::model::*;
use crate::state::BytesSerializer;
use crate::state::KeyedStateBackend;
use crate::storage::FileSystem;
use crate::storage::StateFileWriter;
use crate::with_timer;

/// State a subtask starts from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskStateHandles {
    /// One slot per source and chained operator.
    pub legacy_operator_state: Option<ChainedStateHandle<StreamStateHandle>>,
    /// Already narrowed to the subtask's key group range.
    pub keyed_state: Vec<KeyGroupsStateHandle>,
}

impl TaskStateHandles {
    pub fn is_empty(&self) -> bool {
        self.legacy_operator_state
            .as_ref()
            .map_or(true, |chain| chain.is_empty())
            && self.keyed_state.is_empty()
    }
}

/// Everything needed to start one subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDeploymentDescriptor {
    pub job_id: JobId,
    pub operator_id: OperatorId,
    pub vertex_name: String,
    pub subtask_index: SubtaskIndex,
    pub parallelism: u32,
    pub max_parallelism: u32,
    pub key_group_range: KeyGroupRange,
    pub attempt: u32,
    pub restore_state: Option<TaskStateHandles>,
}

impl TaskDeploymentDescriptor {
    pub fn subtask_info(&self) -> SubtaskInfo {
        SubtaskInfo {
            job_id: self.job_id,
            operator_id: self.operator_id,
            vertex_name: self.vertex_name.clone(),
            subtask_index: self.subtask_index,
            parallelism: self.parallelism,
            max_parallelism: self.max_parallelism,
            key_group_range: self.key_group_range,
            attempt: self.attempt,
        }
    }
}

/// What tasks report back to the job manager besides checkpoint acks
/// and declines.
#[derive(Debug)]
pub enum TaskEvent {
    Acknowledge(AcknowledgeCheckpoint),
    Decline(DeclineCheckpoint),
    /// The source ran out and the task shut down cleanly.
    Finished {
        job_id: JobId,
        operator_id: OperatorId,
        subtask_index: SubtaskIndex,
        attempt: u32,
    },
    Failed {
        job_id: JobId,
        operator_id: OperatorId,
        subtask_index: SubtaskIndex,
        attempt: u32,
        error: String,
    },
}

/// Shared services tasks run against.
#[derive(Clone)]
pub struct TaskEnvironment {
    pub fs: Arc<dyn FileSystem>,
    pub config: Arc<ClusterConfig>,
    pub job_manager: UnboundedSender<JobManagerMessage>,
    pub runtime: Handle,
    pub metrics: SharedMetricStore,
}

impl TaskEnvironment {
    fn report(&self, event: TaskEvent) {
        if self.job_manager.send(JobManagerMessage::Task(event)).is_err() {
            tracing::debug!("Job manager gone; dropping task event");
        }
    }
}

/// Publish the records processed counter every this many records.
const METRIC_REPORT_INTERVAL: u64 = 1024;

struct TaskMetrics {
    records_processed: Counter<u64>,
    snapshot_duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl TaskMetrics {
    fn new(info: &SubtaskInfo) -> Self {
        let meter = opentelemetry::global::meter("snapflow");
        Self {
            records_processed: meter
                .u64_counter("records_processed")
                .with_description("records pulled from the source and run through the chain")
                .init(),
            snapshot_duration: meter
                .f64_histogram("snapshot_sync_duration_seconds")
                .with_description("time the checkpoint lock is held by a snapshot")
                .init(),
            labels: vec![
                KeyValue::new("vertex", info.vertex_name.clone()),
                KeyValue::new("subtask_index", i64::from(info.subtask_index.0)),
            ],
        }
    }
}

/// Everything guarded by the checkpoint lock.
struct TaskCore {
    source: Box<dyn SourceFunction>,
    chain: Vec<Box<dyn StreamOperator>>,
    chain_names: Vec<String>,
    keyed: Option<TaskKeyedStateBackend>,
    records_processed: u64,
    /// Records emitted, per chained operator.
    records_out: Vec<u64>,
}

impl TaskCore {
    fn process(&mut self, info: &SubtaskInfo, record: Record) -> Result<()> {
        let mut batch = vec![record];
        for (operator, emitted) in self.chain.iter_mut().zip(self.records_out.iter_mut()) {
            let mut out = Vec::new();
            for record in batch.drain(..) {
                if let Some(keyed) = self.keyed.as_mut() {
                    keyed.set_current_key(&record.key)?;
                }
                let mut ctx = OperatorContext::new(info, self.keyed.as_mut(), &mut out);
                operator.process(record, &mut ctx)?;
            }
            *emitted += out.len() as u64;
            batch = out;
        }
        self.records_processed += 1;
        Ok(())
    }
}

/// What a snapshot captured while the lock was held.
struct SyncSnapshot {
    legacy: Vec<Option<Vec<u8>>>,
    keyed: Option<KeyGroupsStateHandle>,
}

impl SyncSnapshot {
    fn size(&self) -> usize {
        let legacy: usize = self.legacy.iter().flatten().map(Vec::len).sum();
        let keyed = self
            .keyed
            .as_ref()
            .map_or(0, |handle| handle.delegate.state_size() as usize);
        legacy + keyed
    }
}

/// Checkpoints of one task whose state is still being written.
#[derive(Default)]
struct InFlightCheckpoints {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlightCheckpoints {
    fn begin(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
    }

    fn end(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.drained.notify_all();
            }
        }
    }

    fn wait_drained(&self) {
        if let Ok(count) = self.count.lock() {
            let _drained = self.drained.wait_while(count, |count| *count > 0);
        }
    }
}

/// Counts one checkpoint as in flight until dropped, also if the
/// blocking job never runs.
struct InFlightGuard(StreamTask);

impl InFlightGuard {
    fn new(task: StreamTask) -> Self {
        task.inner.in_flight_checkpoints.begin();
        Self(task)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.inner.in_flight_checkpoints.end();
    }
}

struct TaskInner {
    info: SubtaskInfo,
    env: TaskEnvironment,
    core: Mutex<Option<TaskCore>>,
    running: AtomicBool,
    canceled: AtomicBool,
    in_flight_checkpoints: InFlightCheckpoints,
    /// Snapshots blocked on the checkpoint lock. The task thread lets
    /// them in before taking the lock again.
    snapshots_waiting: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
    metrics: TaskMetrics,
}

/// Handle on a deployed subtask. Cheap to clone.
#[derive(Clone)]
pub struct StreamTask {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for StreamTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTask")
            .field("name", &self.inner.info.task_name())
            .field("running", &self.is_running())
            .finish()
    }
}

impl StreamTask {
    /// Start the task thread.
    ///
    /// Restoring, opening and processing all happen on that thread;
    /// failures are reported to the job manager as
    /// [`TaskEvent::Failed`].
    pub fn deploy(
        tdd: TaskDeploymentDescriptor,
        vertex: JobVertex,
        env: TaskEnvironment,
    ) -> Result<Self> {
        let info = tdd.subtask_info();
        let task = Self {
            inner: Arc::new(TaskInner {
                metrics: TaskMetrics::new(&info),
                info,
                env,
                core: Mutex::new(None),
                running: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                in_flight_checkpoints: InFlightCheckpoints::default(),
                snapshots_waiting: AtomicUsize::new(0),
                thread: Mutex::new(None),
            }),
        };

        let thread_task = task.clone();
        let handle = std::thread::Builder::new()
            .name(task.inner.info.task_name())
            .spawn(move || thread_task.run(tdd.restore_state, vertex))
            .reraise("error spawning task thread")?;
        *task.inner.thread.lock().map_err(|_| Error::LockPoisoned)? = Some(handle);
        Ok(task)
    }

    pub fn info(&self) -> &SubtaskInfo {
        &self.inner.info
    }

    /// Ask the task thread to stop after the current record.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Relaxed);
    }

    /// Block until the task thread exited and no checkpoint of this
    /// task is still being written.
    pub fn wait_for_termination(&self) {
        let handle = match self.inner.thread.lock() {
            Ok(mut thread) => thread.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Task {} panicked", self.inner.info.task_name());
            }
        }
        self.inner.in_flight_checkpoints.wait_drained();
    }

    fn lock_core(&self) -> Result<MutexGuard<'_, Option<TaskCore>>> {
        self.inner.core.lock().map_err(|_| Error::LockPoisoned)
    }

    fn build_core(&self, vertex: &JobVertex) -> Result<TaskCore> {
        let info = &self.inner.info;
        let keyed = match &vertex.keyed_backend {
            Some(kind) => {
                let instance = format!(
                    "{}-{}-{}-{}",
                    info.job_id, info.operator_id, info.subtask_index, info.attempt
                );
                Some(KeyedStateBackend::new(
                    BytesSerializer,
                    info.max_parallelism,
                    info.key_group_range,
                    kind.create_store(&instance)?,
                ))
            }
            None => None,
        };
        Ok(TaskCore {
            source: (vertex.source)(info),
            chain: vertex.chain.iter().map(|(_, factory)| factory(info)).collect(),
            chain_names: vertex.chain.iter().map(|(name, _)| name.clone()).collect(),
            keyed,
            records_processed: 0,
            records_out: vec![0; vertex.chain.len()],
        })
    }

    fn restore(&self, core: &mut TaskCore, state: TaskStateHandles) -> Result<()> {
        let info = &self.inner.info;
        let fs = self.inner.env.fs.as_ref();
        if let Some(chain) = &state.legacy_operator_state {
            if chain.len() != 1 + core.chain.len() {
                return Err(Error::Restore(format!(
                    "non-keyed state has {} slots but task {} chains {} operators",
                    chain.len(),
                    info.task_name(),
                    1 + core.chain.len()
                )));
            }
            if let Some(handle) = chain.get(0) {
                core.source.restore_state(info, handle.read_all(fs)?)?;
            }
            for (index, operator) in core.chain.iter_mut().enumerate() {
                if let Some(handle) = chain.get(index + 1) {
                    operator.restore_state(info, handle.read_all(fs)?)?;
                }
            }
        }
        if !state.keyed_state.is_empty() {
            let keyed = core.keyed.as_mut().ok_or_else(|| {
                Error::Restore(format!(
                    "task {} got keyed state but has no keyed state backend",
                    info.task_name()
                ))
            })?;
            keyed.restore(&state.keyed_state, fs)?;
        }
        tracing::info!("Task {} restored its state", info.task_name());
        Ok(())
    }

    fn run(&self, restore_state: Option<TaskStateHandles>, vertex: JobVertex) {
        let info = &self.inner.info;
        let result = self.run_inner(restore_state, &vertex);
        self.inner.running.store(false, Ordering::Release);

        let disposed = self
            .lock_core()
            .map(|mut core| core.take())
            .unwrap_or_default();
        if let Some(core) = disposed {
            self.publish_metrics(&core);
            if let Some(keyed) = core.keyed {
                if let Err(err) = keyed.dispose() {
                    tracing::warn!(
                        "Error disposing keyed state backend of {}: {err}",
                        info.task_name()
                    );
                }
            }
        }

        match result {
            Ok(true) => {
                tracing::info!("Task {} finished", info.task_name());
                self.inner.env.report(TaskEvent::Finished {
                    job_id: info.job_id,
                    operator_id: info.operator_id,
                    subtask_index: info.subtask_index,
                    attempt: info.attempt,
                });
            }
            Ok(false) => tracing::info!("Task {} canceled", info.task_name()),
            Err(err) => {
                tracing::error!("Task {} failed: {err}", info.task_name());
                self.inner.env.report(TaskEvent::Failed {
                    job_id: info.job_id,
                    operator_id: info.operator_id,
                    subtask_index: info.subtask_index,
                    attempt: info.attempt,
                    error: prepend_tname(err.to_string()),
                });
            }
        }
    }

    /// Returns whether the source finished, as opposed to the task
    /// being canceled.
    fn run_inner(&self, restore_state: Option<TaskStateHandles>, vertex: &JobVertex) -> Result<bool> {
        let info = &self.inner.info;
        let core = self.build_core(vertex)?;
        // Owned by the lock from here on so it is disposed on any exit.
        *self.lock_core()? = Some(core);
        {
            let mut guard = self.lock_core()?;
            let core = guard
                .as_mut()
                .ok_or_else(|| Error::Operator("task state vanished".to_owned()))?;
            if let Some(state) = restore_state {
                self.restore(core, state)?;
            }
            core.source.open(info)?;
            for operator in core.chain.iter_mut() {
                operator.open(info)?;
            }
        }
        self.inner.running.store(true, Ordering::Release);
        tracing::debug!("Task {} running", info.task_name());

        let finished = loop {
            if self.inner.canceled.load(Ordering::Relaxed) {
                break false;
            }
            while self.inner.snapshots_waiting.load(Ordering::Acquire) > 0 {
                std::thread::yield_now();
            }
            let mut guard = self.lock_core()?;
            let core = guard
                .as_mut()
                .ok_or_else(|| Error::Operator("task state vanished".to_owned()))?;
            match core.source.poll_next(info)? {
                SourcePoll::Ready(record) => {
                    core.process(info, record)?;
                    self.inner
                        .metrics
                        .records_processed
                        .add(1, &self.inner.metrics.labels);
                    if core.records_processed % METRIC_REPORT_INTERVAL == 0 {
                        self.publish_metrics(core);
                    }
                }
                SourcePoll::Idle => {
                    drop(guard);
                    std::thread::sleep(Duration::from_millis(1));
                }
                SourcePoll::Finished => break true,
            }
        };

        let mut guard = self.lock_core()?;
        if let Some(core) = guard.as_mut() {
            core.source.close()?;
            for operator in core.chain.iter_mut() {
                operator.close()?;
            }
        }
        Ok(finished)
    }

    fn publish_metrics(&self, core: &TaskCore) {
        let info = &self.inner.info;
        match self.inner.env.metrics.write() {
            Ok(mut store) => {
                store.add_task_metric(
                    info.job_id,
                    info.operator_id,
                    info.subtask_index,
                    "numRecordsIn",
                    core.records_processed,
                );
                if let Some(keyed) = &core.keyed {
                    store.add_task_metric(
                        info.job_id,
                        info.operator_id,
                        info.subtask_index,
                        "numKeyedStates",
                        keyed.registered_states().len(),
                    );
                }
                for (name, emitted) in core.chain_names.iter().zip(&core.records_out) {
                    store.add_operator_metric(
                        info.job_id,
                        info.operator_id,
                        info.subtask_index,
                        name,
                        "numRecordsOut",
                        emitted,
                    );
                }
            }
            Err(_) => tracing::warn!("Metric store lock poisoned"),
        }
    }

    /// Take the synchronous part of a snapshot under the checkpoint
    /// lock.
    fn snapshot_sync(&self, barrier: &CheckpointBarrier) -> Result<SyncSnapshot> {
        self.inner.snapshots_waiting.fetch_add(1, Ordering::AcqRel);
        let guard = self.lock_core();
        self.inner.snapshots_waiting.fetch_sub(1, Ordering::AcqRel);
        let mut guard = guard?;
        let core = guard.as_mut().ok_or_else(|| {
            Error::Operator(format!("task {} is not running", self.inner.info.task_name()))
        })?;
        let mut legacy = Vec::with_capacity(1 + core.chain.len());
        legacy.push(core.source.snapshot_state(barrier.checkpoint_id)?);
        for operator in core.chain.iter_mut() {
            legacy.push(operator.snapshot_state(barrier.checkpoint_id)?);
        }
        let keyed = match core.keyed.as_mut() {
            Some(keyed) => Some(keyed.snapshot(barrier.checkpoint_id)?),
            None => None,
        };
        self.publish_metrics(core);
        Ok(SyncSnapshot { legacy, keyed })
    }

    /// Turn a snapshot into handles the coordinator can keep.
    ///
    /// Small periodic checkpoints stay inline. Otherwise all streams
    /// of this subtask go into one file in the checkpoint location.
    fn persist(&self, barrier: &CheckpointBarrier, snapshot: SyncSnapshot) -> Result<SubtaskState> {
        let config = &self.inner.env.config;
        let inline =
            !barrier.location.kind.is_savepoint() && snapshot.size() < config.file_state_threshold;
        if inline {
            let legacy = snapshot
                .legacy
                .into_iter()
                .map(|bytes| bytes.map(|data| StreamStateHandle::Bytes { data }))
                .collect();
            return Ok(SubtaskState {
                legacy_operator_state: ChainedStateHandle::new(legacy),
                managed_keyed_state: snapshot.keyed,
            });
        }

        let info = &self.inner.info;
        let mut writer = StateFileWriter::new(
            barrier
                .location
                .state_file_path(info.operator_id, info.subtask_index),
        );
        let legacy = snapshot
            .legacy
            .into_iter()
            .map(|bytes| bytes.map(|data| writer.append(&data)))
            .collect();
        let keyed = snapshot.keyed.map(|handle| {
            let delegate = match handle.delegate {
                StreamStateHandle::Bytes { data } => writer.append(&data),
                file => file,
            };
            KeyGroupsStateHandle { delegate, ..handle }
        });
        if !writer.is_empty() {
            writer.finish(self.inner.env.fs.as_ref(), config.write_retries)?;
        }
        Ok(SubtaskState {
            legacy_operator_state: ChainedStateHandle::new(legacy),
            managed_keyed_state: keyed,
        })
    }

    fn perform_checkpoint(&self, barrier: CheckpointBarrier) {
        let info = &self.inner.info;
        let metrics = &self.inner.metrics;
        let result = with_timer!(
            metrics.snapshot_duration,
            metrics.labels,
            self.snapshot_sync(&barrier)
        )
        .and_then(|snapshot| self.persist(&barrier, snapshot));
        match result {
            Ok(subtask_state) => {
                tracing::debug!(
                    "Task {} acknowledging checkpoint {}",
                    info.task_name(),
                    barrier.checkpoint_id
                );
                self.inner
                    .env
                    .report(TaskEvent::Acknowledge(AcknowledgeCheckpoint {
                        job_id: info.job_id,
                        checkpoint_id: barrier.checkpoint_id,
                        operator_id: info.operator_id,
                        subtask_index: info.subtask_index,
                        subtask_state,
                    }));
            }
            Err(err) => {
                tracing::warn!(
                    "Task {} declining checkpoint {}: {err}",
                    info.task_name(),
                    barrier.checkpoint_id
                );
                self.inner.env.report(TaskEvent::Decline(DeclineCheckpoint {
                    job_id: info.job_id,
                    checkpoint_id: barrier.checkpoint_id,
                    operator_id: info.operator_id,
                    subtask_index: info.subtask_index,
                    reason: err.to_string(),
                }));
            }
        }
    }
}

impl TaskGateway for StreamTask {
    fn operator_id(&self) -> OperatorId {
        self.inner.info.operator_id
    }

    fn subtask_index(&self) -> SubtaskIndex {
        self.inner.info.subtask_index
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire) && !self.inner.canceled.load(Ordering::Relaxed)
    }

    fn trigger_checkpoint(&self, barrier: CheckpointBarrier) {
        let in_flight = InFlightGuard::new(self.clone());
        self.inner.env.runtime.spawn_blocking(move || {
            in_flight.0.perform_checkpoint(barrier);
        });
    }
}

/// Deployment descriptors of every subtask of `vertices`, with the
/// given restored state.
pub(crate) fn deployment_descriptors(
    job_id: JobId,
    vertices: &[JobVertex],
    attempt: u32,
    mut restore: HashMap<(OperatorId, SubtaskIndex), TaskStateHandles>,
) -> Vec<TaskDeploymentDescriptor> {
    let mut tdds = Vec::new();
    for vertex in vertices {
        for index in 0..vertex.parallelism {
            let subtask_index = SubtaskIndex(index);
            tdds.push(TaskDeploymentDescriptor {
                job_id,
                operator_id: vertex.operator_id,
                vertex_name: vertex.name.clone(),
                subtask_index,
                parallelism: vertex.parallelism,
                max_parallelism: vertex.max_parallelism,
                key_group_range: KeyGroupRange::for_subtask(
                    vertex.max_parallelism,
                    vertex.parallelism,
                    index,
                ),
                attempt,
                restore_state: restore.remove(&(vertex.operator_id, subtask_index)),
            });
        }
    }
    tdds
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use chrono::Utc;
    use tokio::sync::mpsc;

    use std::path::PathBuf;

    use super::*;
    use crate::metrics::MetricStore;
    use crate::runtime::graph::JobVertex;
    use crate::storage::CheckpointStorage;
    use crate::storage::LocalFileSystem;
    use crate::testing::*;

    fn env(
        dir: &std::path::Path,
        threshold: usize,
    ) -> (TaskEnvironment, mpsc::UnboundedReceiver<JobManagerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ClusterConfig {
            checkpoint_dir: dir.join("checkpoints"),
            state_dir: dir.join("state"),
            file_state_threshold: threshold,
            ..Default::default()
        };
        (
            TaskEnvironment {
                fs: Arc::new(LocalFileSystem),
                config: Arc::new(config),
                job_manager: tx,
                runtime: Handle::current(),
                metrics: Arc::new(RwLock::new(MetricStore::default())),
            },
            rx,
        )
    }

    fn tdd(vertex: &JobVertex) -> TaskDeploymentDescriptor {
        deployment_descriptors(JobId(7), std::slice::from_ref(vertex), 0, HashMap::new())
            .remove(0)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<JobManagerMessage>) -> TaskEvent {
        match rx.recv().await {
            Some(JobManagerMessage::Task(event)) => event,
            other => panic!("expected task event, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn savepoint_state_goes_to_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let (env, mut rx) = env(dir.path(), 1 << 20);
        let latch = CountDownLatch::new(1);
        let vertex = JobVertex::new("counter", 1, {
            let latch = latch.clone();
            move |_| Box::new(StatefulCounter::new(latch.clone())) as Box<dyn SourceFunction>
        });
        let task = StreamTask::deploy(tdd(&vertex), vertex, env.clone()).unwrap();
        latch.wait().await;
        assert!(task.is_running());

        let storage = CheckpointStorage::new(env.fs.clone(), dir.path().join("chk"), None);
        let location = storage
            .resolve_savepoint_location(JobId(7), Some(&dir.path().join("savepoints")))
            .unwrap();
        task.trigger_checkpoint(CheckpointBarrier {
            checkpoint_id: CheckpointId(1),
            timestamp: Utc::now(),
            location: location.clone(),
        });
        match next_event(&mut rx).await {
            TaskEvent::Acknowledge(ack) => {
                assert_eq!(ack.checkpoint_id, CheckpointId(1));
                let paths: Vec<PathBuf> = ack.subtask_state.file_paths().into_iter().collect();
                assert_eq!(
                    paths,
                    vec![location.state_file_path(ack.operator_id, SubtaskIndex(0))]
                );
                assert!(ack.subtask_state.legacy_operator_state.get(0).is_some());
            }
            other => panic!("expected ack, got {other:?}"),
        }

        task.cancel();
        tokio::task::spawn_blocking(move || task.wait_for_termination())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn small_checkpoints_stay_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (env, mut rx) = env(dir.path(), 1 << 20);
        let latch = CountDownLatch::new(1);
        let vertex = JobVertex::new("counter", 1, {
            let latch = latch.clone();
            move |_| Box::new(StatefulCounter::new(latch.clone())) as Box<dyn SourceFunction>
        });
        let task = StreamTask::deploy(tdd(&vertex), vertex, env.clone()).unwrap();
        latch.wait().await;

        let storage = CheckpointStorage::new(env.fs.clone(), dir.path().join("chk"), None);
        let location = storage
            .resolve_checkpoint_location(JobId(7), CheckpointId(3))
            .unwrap();
        task.trigger_checkpoint(CheckpointBarrier {
            checkpoint_id: CheckpointId(3),
            timestamp: Utc::now(),
            location: location.clone(),
        });
        match next_event(&mut rx).await {
            TaskEvent::Acknowledge(ack) => {
                assert!(ack.subtask_state.file_paths().is_empty());
                assert!(matches!(
                    ack.subtask_state.legacy_operator_state.get(0),
                    Some(StreamStateHandle::Bytes { .. })
                ));
            }
            other => panic!("expected ack, got {other:?}"),
        }
        assert!(env.fs.list_dir(&location.dir).unwrap().is_empty());

        task.cancel();
        tokio::task::spawn_blocking(move || task.wait_for_termination())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_writes_decline() {
        let dir = tempfile::tempdir().unwrap();
        let (mut env, mut rx) = env(dir.path(), 0);
        let fs = Arc::new(FlakyFileSystem::default());
        env.fs = fs.clone();
        let latch = CountDownLatch::new(1);
        let vertex = JobVertex::new("counter", 1, {
            let latch = latch.clone();
            move |_| Box::new(StatefulCounter::new(latch.clone())) as Box<dyn SourceFunction>
        });
        let task = StreamTask::deploy(tdd(&vertex), vertex, env.clone()).unwrap();
        latch.wait().await;

        let storage = CheckpointStorage::new(env.fs.clone(), dir.path().join("chk"), None);
        let location = storage
            .resolve_checkpoint_location(JobId(7), CheckpointId(1))
            .unwrap();
        fs.fail_writes(true);
        task.trigger_checkpoint(CheckpointBarrier {
            checkpoint_id: CheckpointId(1),
            timestamp: Utc::now(),
            location,
        });
        match next_event(&mut rx).await {
            TaskEvent::Decline(decline) => assert_eq!(decline.checkpoint_id, CheckpointId(1)),
            other => panic!("expected decline, got {other:?}"),
        }
        // The task keeps running.
        assert!(task.is_running());

        task.cancel();
        tokio::task::spawn_blocking(move || task.wait_for_termination())
            .await
            .unwrap();
    }

    #[test]
    fn termination_waits_for_in_flight_checkpoints() {
        let in_flight = Arc::new(InFlightCheckpoints::default());
        in_flight.begin();
        in_flight.begin();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let waiter = {
            let in_flight = in_flight.clone();
            std::thread::spawn(move || {
                in_flight.wait_drained();
                done_tx.send(()).unwrap();
            })
        };
        in_flight.end();
        assert!(done_rx
            .recv_timeout(std::time::Duration::from_millis(50))
            .is_err());
        in_flight.end();
        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        waiter.join().unwrap();
        // Nothing in flight returns right away.
        in_flight.wait_drained();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_source_reports_finished() {
        let dir = tempfile::tempdir().unwrap();
        let (env, mut rx) = env(dir.path(), 0);
        let vertex = JobVertex::new("ints", 1, |_| {
            Box::new(IntegerStreamSource::new(10)) as Box<dyn SourceFunction>
        });
        let _task = StreamTask::deploy(tdd(&vertex), vertex, env).unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TaskEvent::Finished { attempt: 0, .. }
        ));
    }
}
