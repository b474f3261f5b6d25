//! The checkpoint coordinator of one job.
//!
//! Each checkpoint attempt goes `PENDING -> COMPLETED | DECLINED |
//! EXPIRED`. The coordinator hands a [`CheckpointBarrier`] to every
//! task, collects one [`AcknowledgeCheckpoint`] per subtask and, once
//! all are in, writes the metadata file. It is owned by the job
//! manager actor and never shared, so nothing in here locks.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use tokio::sync::oneshot;
use tracing::instrument;

use crate::config::CheckpointingSettings;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::TriggerFailure;
use crate::model::*;
use crate::storage::savepoint::store_metadata;
use crate::storage::CheckpointStorage;
use crate::storage::CheckpointStorageLocation;
use crate::storage::FileSystem;

/// Sent to every task to start a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointBarrier {
    pub checkpoint_id: CheckpointId,
    pub timestamp: DateTime<Utc>,
    /// Where the task writes state files.
    pub location: CheckpointStorageLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeCheckpoint {
    pub job_id: JobId,
    pub checkpoint_id: CheckpointId,
    pub operator_id: OperatorId,
    pub subtask_index: SubtaskIndex,
    pub subtask_state: SubtaskState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclineCheckpoint {
    pub job_id: JobId,
    pub checkpoint_id: CheckpointId,
    pub operator_id: OperatorId,
    pub subtask_index: SubtaskIndex,
    pub reason: String,
}

/// How the coordinator reaches a task.
pub trait TaskGateway: Send + Sync {
    fn operator_id(&self) -> OperatorId;

    fn subtask_index(&self) -> SubtaskIndex;

    fn is_running(&self) -> bool;

    /// Fire and forget. The answer comes back as an ack or decline.
    fn trigger_checkpoint(&self, barrier: CheckpointBarrier);
}

/// Shape of one job vertex, as far as checkpoints care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexShape {
    pub operator_id: OperatorId,
    pub parallelism: u32,
    pub max_parallelism: u32,
    pub chain_length: usize,
}

/// Reply with the checkpoint or savepoint directory once done.
pub type CompletionSender = oneshot::Sender<Result<PathBuf>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Recorded. More acks may be needed.
    Success,
    /// This subtask already acknowledged.
    Duplicate,
    /// Not a pending checkpoint.
    Unknown,
}

/// A checkpoint that has been triggered but not all tasks have
/// acknowledged yet.
#[derive(Debug)]
pub struct PendingCheckpoint {
    job_id: JobId,
    checkpoint_id: CheckpointId,
    timestamp: DateTime<Utc>,
    location: CheckpointStorageLocation,
    not_yet_acknowledged: HashSet<(OperatorId, SubtaskIndex)>,
    task_states: BTreeMap<OperatorId, TaskState>,
    on_completion: Option<CompletionSender>,
}

impl PendingCheckpoint {
    fn new(
        job_id: JobId,
        checkpoint_id: CheckpointId,
        timestamp: DateTime<Utc>,
        location: CheckpointStorageLocation,
        tasks: &[Arc<dyn TaskGateway>],
        vertices: &[VertexShape],
    ) -> Self {
        Self {
            job_id,
            checkpoint_id,
            timestamp,
            location,
            not_yet_acknowledged: tasks
                .iter()
                .map(|t| (t.operator_id(), t.subtask_index()))
                .collect(),
            task_states: vertices
                .iter()
                .map(|v| {
                    (
                        v.operator_id,
                        TaskState::new(
                            v.operator_id,
                            v.parallelism,
                            v.max_parallelism,
                            v.chain_length,
                        ),
                    )
                })
                .collect(),
            on_completion: None,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn is_savepoint(&self) -> bool {
        self.location.kind.is_savepoint()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.not_yet_acknowledged.is_empty()
    }

    pub fn number_of_acknowledged_tasks(&self, operator_id: OperatorId) -> usize {
        self.task_states
            .get(&operator_id)
            .map_or(0, TaskState::number_collected_states)
    }

    fn acknowledge_task(
        &mut self,
        operator_id: OperatorId,
        subtask_index: SubtaskIndex,
        state: SubtaskState,
    ) -> Result<AckOutcome> {
        if !self.not_yet_acknowledged.remove(&(operator_id, subtask_index)) {
            return Ok(AckOutcome::Duplicate);
        }
        if state.has_state() {
            let task_state = self.task_states.get_mut(&operator_id).ok_or_else(|| {
                Error::Operator(format!("ack from unknown operator {operator_id}"))
            })?;
            task_state.put_state(subtask_index, state)?;
        }
        Ok(AckOutcome::Success)
    }

    fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            version: METADATA_VERSION,
            job_id: self.job_id,
            checkpoint_id: self.checkpoint_id,
            timestamp: self.timestamp,
            kind: self.location.kind,
            task_states: self
                .task_states
                .values()
                .filter(|t| t.has_state())
                .cloned()
                .collect(),
        }
    }

    /// Write the metadata file.
    fn finalize(&self, fs: &dyn FileSystem) -> Result<CompletedCheckpoint> {
        let metadata = self.metadata();
        let metadata_path = store_metadata(fs, &self.location, &metadata)?;
        Ok(CompletedCheckpoint {
            metadata,
            location: self.location.clone(),
            metadata_path,
        })
    }

    /// Throw away everything received so far and tell whoever waits.
    fn abort(mut self, fs: &dyn FileSystem, err: Error) {
        for task_state in self.task_states.values() {
            if let Err(err) = task_state.discard_state(fs) {
                tracing::warn!(
                    "Error discarding state of aborted checkpoint {}: {err}",
                    self.checkpoint_id
                );
            }
        }
        if let Err(err) = fs.delete_dir(&self.location.dir, true) {
            if !err.is_not_found() {
                tracing::warn!(
                    "Error removing directory of aborted checkpoint {}: {err}",
                    self.checkpoint_id
                );
            }
        }
        if let Some(tx) = self.on_completion.take() {
            // The requester might have given up already.
            let _ = tx.send(Err(err));
        }
    }
}

/// A checkpoint whose metadata has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCheckpoint {
    pub metadata: CheckpointMetadata,
    pub location: CheckpointStorageLocation,
    pub metadata_path: PathBuf,
}

impl CompletedCheckpoint {
    pub fn checkpoint_id(&self) -> CheckpointId {
        self.metadata.checkpoint_id
    }

    /// Delete state, metadata and directory. Best effort.
    pub fn discard(&self, fs: &dyn FileSystem) {
        if let Err(err) = self.metadata.discard_state(fs) {
            tracing::warn!(
                "Error discarding state of checkpoint {}: {err}",
                self.checkpoint_id()
            );
        }
        if let Err(err) = fs.delete_dir(&self.location.dir, true) {
            if !err.is_not_found() {
                tracing::warn!(
                    "Error removing directory of checkpoint {}: {err}",
                    self.checkpoint_id()
                );
            }
        }
    }
}

/// The most recent completed periodic checkpoints.
#[derive(Debug)]
pub struct CompletedCheckpointStore {
    max_retained: usize,
    checkpoints: VecDeque<CompletedCheckpoint>,
}

impl CompletedCheckpointStore {
    pub fn new(max_retained: usize) -> Self {
        Self {
            max_retained: max_retained.max(1),
            checkpoints: VecDeque::new(),
        }
    }

    /// Returns the checkpoints that fell out of retention.
    pub fn add(&mut self, checkpoint: CompletedCheckpoint) -> Vec<CompletedCheckpoint> {
        self.checkpoints.push_back(checkpoint);
        let excess = self.checkpoints.len().saturating_sub(self.max_retained);
        self.checkpoints.drain(..excess).collect()
    }

    pub fn latest(&self) -> Option<&CompletedCheckpoint> {
        self.checkpoints.back()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &CompletedCheckpoint> {
        self.checkpoints.iter()
    }

    /// Discard every retained checkpoint.
    pub fn shutdown(&mut self, fs: &dyn FileSystem) {
        for checkpoint in self.checkpoints.drain(..) {
            checkpoint.discard(fs);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Completed,
    Aborted,
}

/// Remember this many resolved checkpoint IDs for late acks.
const RESOLVED_HISTORY: usize = 64;

struct CoordinatorMetrics {
    completed: Counter<u64>,
    declined: Counter<u64>,
    expired: Counter<u64>,
    duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl CoordinatorMetrics {
    fn new(job_id: JobId) -> Self {
        let meter = opentelemetry::global::meter("snapflow");
        Self {
            completed: meter
                .u64_counter("checkpoints_completed")
                .with_description("checkpoints and savepoints whose metadata was written")
                .init(),
            declined: meter
                .u64_counter("checkpoints_declined")
                .with_description("checkpoints aborted because a task declined")
                .init(),
            expired: meter
                .u64_counter("checkpoints_expired")
                .with_description("checkpoints aborted by timeout")
                .init(),
            duration: meter
                .f64_histogram("checkpoint_duration_seconds")
                .with_description("time from trigger to completed metadata")
                .init(),
            labels: vec![KeyValue::new("job_id", job_id.to_string())],
        }
    }
}

/// Drives checkpoints and savepoints of one job.
pub struct CheckpointCoordinator {
    job_id: JobId,
    settings: CheckpointingSettings,
    storage: CheckpointStorage,
    tasks: Vec<Arc<dyn TaskGateway>>,
    vertices: Vec<VertexShape>,
    next_checkpoint_id: u64,
    pending: BTreeMap<CheckpointId, PendingCheckpoint>,
    resolved: VecDeque<(CheckpointId, Resolution)>,
    completed: CompletedCheckpointStore,
    consecutive_failures: u32,
    shut_down: bool,
    metrics: CoordinatorMetrics,
}

impl std::fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("job_id", &self.job_id)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("retained", &self.completed.len())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl CheckpointCoordinator {
    pub fn new(
        job_id: JobId,
        settings: CheckpointingSettings,
        storage: CheckpointStorage,
        vertices: Vec<VertexShape>,
    ) -> Self {
        Self {
            job_id,
            completed: CompletedCheckpointStore::new(settings.retained),
            settings,
            storage,
            tasks: Vec::new(),
            vertices,
            next_checkpoint_id: 1,
            pending: BTreeMap::new(),
            resolved: VecDeque::new(),
            consecutive_failures: 0,
            shut_down: false,
            metrics: CoordinatorMetrics::new(job_id),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn settings(&self) -> &CheckpointingSettings {
        &self.settings
    }

    /// Replace the tasks barriers go to, as after a restart.
    pub fn set_tasks(&mut self, tasks: Vec<Arc<dyn TaskGateway>>) {
        self.tasks = tasks;
    }

    fn fs(&self) -> &dyn FileSystem {
        self.storage.fs().as_ref()
    }

    pub fn number_of_pending_checkpoints(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_checkpoint(&self, checkpoint_id: CheckpointId) -> Option<&PendingCheckpoint> {
        self.pending.get(&checkpoint_id)
    }

    pub fn completed_checkpoints(&self) -> &CompletedCheckpointStore {
        &self.completed
    }

    pub fn latest_completed(&self) -> Option<&CompletedCheckpoint> {
        self.completed.latest()
    }

    /// Have more checkpoints in a row failed than tolerated?
    pub fn failure_threshold_exceeded(&self) -> bool {
        self.consecutive_failures > self.settings.tolerable_failures
    }

    /// Start a checkpoint, or a savepoint if `is_savepoint`.
    ///
    /// Savepoints go into a fresh directory under `target_dir` or the
    /// configured default and ignore the concurrency limit. Failing
    /// here leaves no pending checkpoint behind.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub fn trigger_checkpoint(
        &mut self,
        timestamp: DateTime<Utc>,
        is_savepoint: bool,
        target_dir: Option<&Path>,
    ) -> Result<CheckpointId> {
        if self.shut_down {
            return Err(TriggerFailure::CoordinatorShutdown.into());
        }
        if self.tasks.is_empty() {
            return Err(TriggerFailure::NoCheckpointableTasks.into());
        }
        if !self.tasks.iter().all(|t| t.is_running()) {
            return Err(TriggerFailure::NotAllTasksRunning.into());
        }
        if !is_savepoint {
            let pending_periodic = self.pending.values().filter(|p| !p.is_savepoint()).count();
            if pending_periodic >= self.settings.max_concurrent {
                return Err(TriggerFailure::TooManyConcurrentCheckpoints.into());
            }
        }

        let checkpoint_id = CheckpointId(self.next_checkpoint_id);
        let location = if is_savepoint {
            self.storage
                .resolve_savepoint_location(self.job_id, target_dir)?
        } else {
            self.storage
                .resolve_checkpoint_location(self.job_id, checkpoint_id)?
        };
        self.next_checkpoint_id += 1;

        let pending = PendingCheckpoint::new(
            self.job_id,
            checkpoint_id,
            timestamp,
            location.clone(),
            &self.tasks,
            &self.vertices,
        );
        self.pending.insert(checkpoint_id, pending);
        tracing::info!(
            "Triggering {} {checkpoint_id} into {:?}",
            location.kind,
            location.dir
        );

        let barrier = CheckpointBarrier {
            checkpoint_id,
            timestamp,
            location,
        };
        for task in &self.tasks {
            task.trigger_checkpoint(barrier.clone());
        }
        Ok(checkpoint_id)
    }

    /// Be told with the checkpoint or savepoint directory once the
    /// checkpoint completes, or with the error that aborted it.
    pub fn on_completion(&mut self, checkpoint_id: CheckpointId, tx: CompletionSender) {
        match self.pending.get_mut(&checkpoint_id) {
            Some(pending) => pending.on_completion = Some(tx),
            None => {
                let _ = tx.send(Err(Error::Aborted {
                    checkpoint_id,
                    reason: "checkpoint is no longer pending".to_owned(),
                }));
            }
        }
    }

    fn remember(&mut self, checkpoint_id: CheckpointId, resolution: Resolution) {
        self.resolved.push_back((checkpoint_id, resolution));
        if self.resolved.len() > RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
    }

    fn resolution(&self, checkpoint_id: CheckpointId) -> Option<Resolution> {
        self.resolved
            .iter()
            .find(|(id, _)| *id == checkpoint_id)
            .map(|(_, resolution)| *resolution)
    }

    /// Record one subtask's state.
    ///
    /// Completes the checkpoint when it was the last one missing.
    /// Acks for checkpoints that were aborted have their state thrown
    /// away.
    pub fn receive_acknowledge(&mut self, ack: AcknowledgeCheckpoint) -> AckOutcome {
        let checkpoint_id = ack.checkpoint_id;
        let Some(pending) = self.pending.get_mut(&checkpoint_id) else {
            match self.resolution(checkpoint_id) {
                Some(Resolution::Aborted) => {
                    tracing::debug!(
                        "Discarding late ack of {}/{} for aborted checkpoint {checkpoint_id}",
                        ack.operator_id,
                        ack.subtask_index
                    );
                    if let Err(err) = ack.subtask_state.discard_state(self.fs()) {
                        tracing::warn!("Error discarding late ack state: {err}");
                    }
                }
                Some(Resolution::Completed) => {
                    tracing::debug!("Ignoring duplicate ack for completed checkpoint {checkpoint_id}");
                }
                None => tracing::warn!("Ignoring ack for unknown checkpoint {checkpoint_id}"),
            }
            return AckOutcome::Unknown;
        };

        let outcome = match pending.acknowledge_task(
            ack.operator_id,
            ack.subtask_index,
            ack.subtask_state,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.abort_pending(checkpoint_id, err);
                return AckOutcome::Unknown;
            }
        };
        if outcome == AckOutcome::Duplicate {
            tracing::debug!(
                "Duplicate ack of {}/{} for checkpoint {checkpoint_id}",
                ack.operator_id,
                ack.subtask_index
            );
        }
        if pending.is_fully_acknowledged() {
            self.complete_pending(checkpoint_id);
        }
        outcome
    }

    fn complete_pending(&mut self, checkpoint_id: CheckpointId) {
        let Some(mut pending) = self.pending.remove(&checkpoint_id) else {
            return;
        };
        let fs = self.storage.fs().clone();
        let is_savepoint = pending.is_savepoint();
        let completed = match pending.finalize(fs.as_ref()) {
            Ok(completed) => completed,
            Err(err) => {
                tracing::warn!("Error finalizing checkpoint {checkpoint_id}: {err}");
                if !is_savepoint {
                    self.consecutive_failures += 1;
                }
                self.remember(checkpoint_id, Resolution::Aborted);
                pending.abort(fs.as_ref(), err);
                return;
            }
        };

        let dir = completed.location.dir.clone();
        tracing::info!(
            "Completed {} {checkpoint_id} ({} bytes) at {dir:?}",
            completed.metadata.kind,
            completed.metadata.state_size()
        );
        self.remember(checkpoint_id, Resolution::Completed);
        self.metrics.completed.add(1, &self.metrics.labels);
        let elapsed = (Utc::now() - pending.timestamp).num_milliseconds().max(0);
        self.metrics
            .duration
            .record(elapsed as f64 / 1000.0, &self.metrics.labels);

        if !is_savepoint {
            self.consecutive_failures = 0;
            for subsumed in self.completed.add(completed) {
                tracing::debug!("Discarding subsumed checkpoint {}", subsumed.checkpoint_id());
                subsumed.discard(fs.as_ref());
            }
            // Older periodic checkpoints can no longer be useful.
            let older: Vec<CheckpointId> = self
                .pending
                .iter()
                .filter(|(id, p)| **id < checkpoint_id && !p.is_savepoint())
                .map(|(id, _)| *id)
                .collect();
            for id in older {
                self.abort_pending(
                    id,
                    Error::Aborted {
                        checkpoint_id: id,
                        reason: format!("subsumed by checkpoint {checkpoint_id}"),
                    },
                );
            }
        }
        if let Some(tx) = pending.on_completion.take() {
            let _ = tx.send(Ok(dir));
        }
    }

    /// A task could not take its part of a checkpoint.
    pub fn receive_decline(&mut self, decline: DeclineCheckpoint) {
        if !self.pending.contains_key(&decline.checkpoint_id) {
            tracing::debug!(
                "Ignoring decline of unknown checkpoint {}",
                decline.checkpoint_id
            );
            return;
        }
        tracing::warn!(
            "Checkpoint {} declined by {}/{}: {}",
            decline.checkpoint_id,
            decline.operator_id,
            decline.subtask_index,
            decline.reason
        );
        self.metrics.declined.add(1, &self.metrics.labels);
        self.abort_pending(
            decline.checkpoint_id,
            Error::Declined {
                checkpoint_id: decline.checkpoint_id,
                reason: decline.reason,
            },
        );
    }

    /// Abort a checkpoint that took too long. No-op if it is already
    /// resolved.
    pub fn expire(&mut self, checkpoint_id: CheckpointId) {
        if self.pending.contains_key(&checkpoint_id) {
            tracing::warn!("Checkpoint {checkpoint_id} expired");
            self.metrics.expired.add(1, &self.metrics.labels);
            self.abort_pending(checkpoint_id, Error::Expired(checkpoint_id));
        }
    }

    /// Abort one pending checkpoint. Counts towards the failure
    /// threshold unless it is a savepoint or was subsumed.
    pub fn abort_pending(&mut self, checkpoint_id: CheckpointId, err: Error) {
        let Some(pending) = self.pending.remove(&checkpoint_id) else {
            return;
        };
        if !pending.is_savepoint() && !matches!(err, Error::Aborted { .. }) {
            self.consecutive_failures += 1;
        }
        self.remember(checkpoint_id, Resolution::Aborted);
        pending.abort(self.storage.fs().as_ref(), err);
    }

    /// Abort everything pending, as on restart or cancellation.
    pub fn abort_all_pending(&mut self, reason: &str) {
        let ids: Vec<CheckpointId> = self.pending.keys().copied().collect();
        for checkpoint_id in ids {
            self.abort_pending(
                checkpoint_id,
                Error::Aborted {
                    checkpoint_id,
                    reason: reason.to_owned(),
                },
            );
        }
    }

    /// Stop for good: abort pending checkpoints, discard retained ones
    /// and remove the job's checkpoint directory. Savepoints stay.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.abort_all_pending("checkpoint coordinator shut down");
        self.completed.shutdown(self.storage.fs().as_ref());
        let job_dir = self.storage.job_checkpoint_dir(self.job_id);
        if let Err(err) = self.fs().delete_dir(&job_dir, true) {
            if !err.is_not_found() {
                tracing::warn!("Error removing checkpoint directory {job_dir:?}: {err}");
            }
        }
        tracing::info!("Checkpoint coordinator of job {} shut down", self.job_id);
    }
}

/// Shapes of the vertices of a job, in order.
pub(crate) fn vertex_shapes<'a>(
    vertices: impl IntoIterator<Item = &'a super::graph::JobVertex>,
) -> Vec<VertexShape> {
    vertices
        .into_iter()
        .map(|v| VertexShape {
            operator_id: v.operator_id,
            parallelism: v.parallelism,
            max_parallelism: v.max_parallelism,
            chain_length: v.chain_length(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::storage::LocalFileSystem;
    use crate::storage::StateFileWriter;

    /// Records the barriers it receives instead of snapshotting.
    #[derive(Default)]
    struct MockTask {
        operator_id: OperatorId,
        subtask_index: SubtaskIndex,
        barriers: Mutex<Vec<CheckpointBarrier>>,
    }

    impl TaskGateway for MockTask {
        fn operator_id(&self) -> OperatorId {
            self.operator_id
        }

        fn subtask_index(&self) -> SubtaskIndex {
            self.subtask_index
        }

        fn is_running(&self) -> bool {
            true
        }

        fn trigger_checkpoint(&self, barrier: CheckpointBarrier) {
            self.barriers.lock().unwrap().push(barrier);
        }
    }

    const OP: OperatorId = OperatorId(0x42);

    fn coordinator(
        root: &Path,
        parallelism: u32,
        settings: CheckpointingSettings,
    ) -> (CheckpointCoordinator, Vec<Arc<MockTask>>) {
        let storage = CheckpointStorage::new(
            Arc::new(LocalFileSystem),
            root.join("checkpoints"),
            Some(root.join("savepoints")),
        );
        let mut coordinator = CheckpointCoordinator::new(
            JobId(1),
            settings,
            storage,
            vec![VertexShape {
                operator_id: OP,
                parallelism,
                max_parallelism: 128,
                chain_length: 1,
            }],
        );
        let tasks: Vec<Arc<MockTask>> = (0..parallelism)
            .map(|i| {
                Arc::new(MockTask {
                    operator_id: OP,
                    subtask_index: SubtaskIndex(i),
                    ..Default::default()
                })
            })
            .collect();
        coordinator.set_tasks(
            tasks
                .iter()
                .map(|t| t.clone() as Arc<dyn TaskGateway>)
                .collect(),
        );
        (coordinator, tasks)
    }

    /// Write a state file for `task` the way a stream task would.
    fn ack(task: &MockTask, checkpoint_id: CheckpointId) -> AcknowledgeCheckpoint {
        let barrier = task
            .barriers
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.checkpoint_id == checkpoint_id)
            .cloned()
            .unwrap();
        let mut writer = StateFileWriter::new(
            barrier
                .location
                .state_file_path(task.operator_id, task.subtask_index),
        );
        let handle = writer.append(format!("state of {}", task.subtask_index).as_bytes());
        writer.finish(&LocalFileSystem, 0).unwrap();
        AcknowledgeCheckpoint {
            job_id: JobId(1),
            checkpoint_id,
            operator_id: task.operator_id,
            subtask_index: task.subtask_index,
            subtask_state: SubtaskState {
                legacy_operator_state: ChainedStateHandle::wrap_single(handle),
                managed_keyed_state: None,
            },
        }
    }

    fn decline(task: &MockTask, checkpoint_id: CheckpointId) -> DeclineCheckpoint {
        DeclineCheckpoint {
            job_id: JobId(1),
            checkpoint_id,
            operator_id: task.operator_id,
            subtask_index: task.subtask_index,
            reason: "disk full".to_owned(),
        }
    }

    #[test]
    fn savepoint_completes_after_all_acks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, tasks) = coordinator(dir.path(), 4, Default::default());
        let id = coordinator.trigger_checkpoint(Utc::now(), true, None).unwrap();
        let (tx, mut rx) = oneshot::channel();
        coordinator.on_completion(id, tx);

        for task in &tasks[..3] {
            assert_eq!(coordinator.receive_acknowledge(ack(task, id)), AckOutcome::Success);
        }
        let pending = coordinator.pending_checkpoint(id).unwrap();
        assert_eq!(pending.number_of_acknowledged_tasks(OP), 3);
        assert!(rx.try_recv().is_err());

        // Acks are idempotent.
        assert_eq!(
            coordinator.receive_acknowledge(ack(&tasks[0], id)),
            AckOutcome::Duplicate
        );
        assert_eq!(
            coordinator.receive_acknowledge(ack(&tasks[3], id)),
            AckOutcome::Success
        );
        let savepoint_dir = rx.try_recv().unwrap().unwrap();
        assert_eq!(std::fs::read_dir(&savepoint_dir).unwrap().count(), 5);
        assert_eq!(coordinator.number_of_pending_checkpoints(), 0);
        // Savepoints are not retained checkpoints.
        assert!(coordinator.completed_checkpoints().is_empty());

        // Late ack for a completed checkpoint leaves its files alone.
        assert_eq!(
            coordinator.receive_acknowledge(ack(&tasks[1], id)),
            AckOutcome::Unknown
        );
        assert_eq!(std::fs::read_dir(&savepoint_dir).unwrap().count(), 5);
    }

    #[test]
    fn trigger_failures_leave_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, _tasks) = coordinator(dir.path(), 1, Default::default());
        coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        let err = coordinator
            .trigger_checkpoint(Utc::now(), false, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Trigger(TriggerFailure::TooManyConcurrentCheckpoints)
        ));
        // Savepoints are forced.
        coordinator.trigger_checkpoint(Utc::now(), true, None).unwrap();
        assert_eq!(coordinator.number_of_pending_checkpoints(), 2);

        let storage = CheckpointStorage::new(
            Arc::new(LocalFileSystem),
            dir.path().join("checkpoints"),
            None,
        );
        let mut no_default = CheckpointCoordinator::new(JobId(2), Default::default(), storage, vec![]);
        let err = no_default
            .trigger_checkpoint(Utc::now(), true, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Trigger(TriggerFailure::NoCheckpointableTasks)
        ));
        no_default.set_tasks(vec![Arc::new(MockTask::default())]);
        let err = no_default
            .trigger_checkpoint(Utc::now(), true, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Trigger(TriggerFailure::NoSavepointDirectory)
        ));
        assert_eq!(no_default.number_of_pending_checkpoints(), 0);
    }

    #[test]
    fn decline_discards_received_state() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, tasks) = coordinator(dir.path(), 2, Default::default());
        let id = coordinator.trigger_checkpoint(Utc::now(), true, None).unwrap();
        let (tx, mut rx) = oneshot::channel();
        coordinator.on_completion(id, tx);
        let first = ack(&tasks[0], id);
        let path = first.subtask_state.file_paths().into_iter().next().unwrap();
        coordinator.receive_acknowledge(first);
        assert!(path.exists());

        coordinator.receive_decline(decline(&tasks[1], id));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::Declined { .. })
        ));
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());

        // A late ack of the aborted savepoint has its file removed.
        let late = ack_after_abort(&tasks[1], id, dir.path());
        let late_path = late.subtask_state.file_paths().into_iter().next().unwrap();
        assert_eq!(coordinator.receive_acknowledge(late), AckOutcome::Unknown);
        assert!(!late_path.exists());
    }

    /// Like [`ack`] but for a checkpoint whose directory is gone.
    fn ack_after_abort(task: &MockTask, id: CheckpointId, root: &Path) -> AcknowledgeCheckpoint {
        let path = root.join("late-state");
        let mut writer = StateFileWriter::new(path);
        let handle = writer.append(b"late");
        writer.finish(&LocalFileSystem, 0).unwrap();
        AcknowledgeCheckpoint {
            job_id: JobId(1),
            checkpoint_id: id,
            operator_id: task.operator_id,
            subtask_index: task.subtask_index,
            subtask_state: SubtaskState {
                legacy_operator_state: ChainedStateHandle::wrap_single(handle),
                managed_keyed_state: None,
            },
        }
    }

    #[test]
    fn expiry_and_failure_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let settings = CheckpointingSettings {
            tolerable_failures: 1,
            ..Default::default()
        };
        let (mut coordinator, tasks) = coordinator(dir.path(), 1, settings);

        let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        coordinator.expire(id);
        assert_eq!(coordinator.number_of_pending_checkpoints(), 0);
        assert!(!coordinator.failure_threshold_exceeded());
        // Expiring twice is a no-op.
        coordinator.expire(id);

        let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        coordinator.receive_decline(decline(&tasks[0], id));
        assert!(coordinator.failure_threshold_exceeded());

        // Savepoint failures don't count and success resets.
        let (mut coordinator, tasks) = coordinator_with_one_failure(dir.path());
        let id = coordinator.trigger_checkpoint(Utc::now(), true, None).unwrap();
        coordinator.receive_decline(decline(&tasks[0], id));
        let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        coordinator.receive_acknowledge(ack(&tasks[0], id));
        let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        coordinator.receive_decline(decline(&tasks[0], id));
        assert!(!coordinator.failure_threshold_exceeded());
    }

    fn coordinator_with_one_failure(root: &Path) -> (CheckpointCoordinator, Vec<Arc<MockTask>>) {
        let settings = CheckpointingSettings {
            tolerable_failures: 1,
            ..Default::default()
        };
        let (mut coordinator, tasks) = coordinator(&root.join("second"), 1, settings);
        let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        coordinator.expire(id);
        (coordinator, tasks)
    }

    #[test]
    fn retention_discards_subsumed_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let settings = CheckpointingSettings {
            retained: 2,
            ..Default::default()
        };
        let (mut coordinator, tasks) = coordinator(dir.path(), 2, settings);
        let mut dirs = Vec::new();
        for _ in 0..3 {
            let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
            for task in &tasks {
                coordinator.receive_acknowledge(ack(task, id));
            }
            dirs.push(coordinator.latest_completed().unwrap().location.dir.clone());
        }
        assert_eq!(coordinator.completed_checkpoints().len(), 2);
        assert!(!dirs[0].exists());
        assert!(dirs[1].join("_metadata").exists());
        assert!(dirs[2].join("_metadata").exists());
        assert_eq!(
            coordinator.latest_completed().unwrap().checkpoint_id(),
            CheckpointId(3)
        );

        coordinator.shutdown();
        let job_dir = dir.path().join("checkpoints").join(JobId(1).to_string());
        assert!(!job_dir.exists());
        assert!(matches!(
            coordinator.trigger_checkpoint(Utc::now(), true, None),
            Err(Error::Trigger(TriggerFailure::CoordinatorShutdown))
        ));
    }

    #[test]
    fn completed_metadata_covers_every_subtask() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, tasks) = coordinator(dir.path(), 3, Default::default());
        let id = coordinator.trigger_checkpoint(Utc::now(), false, None).unwrap();
        for task in tasks.iter().rev() {
            coordinator.receive_acknowledge(ack(task, id));
        }
        let completed = coordinator.latest_completed().unwrap();
        let task_state = completed.metadata.task_state(OP).unwrap();
        assert_eq!(task_state.number_collected_states(), 3);
        let loaded = crate::storage::savepoint::load_metadata(
            &LocalFileSystem,
            &completed.metadata_path,
        )
        .unwrap();
        assert_eq!(loaded, completed.metadata);
    }
}
