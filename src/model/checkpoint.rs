//! What a checkpoint or savepoint contains.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::*;
use crate::errors::Error;
use crate::errors::Result;
use crate::storage::FileSystem;

/// Version of the serialized [`CheckpointMetadata`] layout.
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Periodic, owned by the runtime and subsumed by newer ones.
    Checkpoint,
    /// User triggered, owned by the user until explicitly disposed.
    Savepoint,
}

impl CheckpointKind {
    pub fn is_savepoint(&self) -> bool {
        matches!(self, Self::Savepoint)
    }
}

impl Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Savepoint => write!(f, "savepoint"),
        }
    }
}

/// The state one subtask acknowledged for one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskState {
    /// Opaque per-operator bytes, one slot per chained operator with
    /// the source at slot 0.
    pub legacy_operator_state: ChainedStateHandle<StreamStateHandle>,
    pub managed_keyed_state: Option<KeyGroupsStateHandle>,
}

impl SubtaskState {
    pub fn empty(chain_length: usize) -> Self {
        Self {
            legacy_operator_state: ChainedStateHandle::new(vec![None; chain_length]),
            managed_keyed_state: None,
        }
    }

    pub fn has_state(&self) -> bool {
        !self.legacy_operator_state.is_empty() || self.managed_keyed_state.is_some()
    }

    /// Every file this state points into.
    pub fn file_paths(&self) -> BTreeSet<PathBuf> {
        self.legacy_operator_state
            .iter()
            .flatten()
            .chain(self.managed_keyed_state.iter().map(|k| &k.delegate))
            .filter_map(|h| h.file_path().map(PathBuf::from))
            .collect()
    }
}

impl StateObject for SubtaskState {
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()> {
        let legacy = self.legacy_operator_state.discard_state(fs);
        let keyed = self
            .managed_keyed_state
            .as_ref()
            .map_or(Ok(()), |k| k.discard_state(fs));
        legacy.and(keyed)
    }

    fn state_size(&self) -> u64 {
        self.legacy_operator_state.state_size()
            + self
                .managed_keyed_state
                .as_ref()
                .map_or(0, StateObject::state_size)
    }
}

/// The collected state of every subtask of one operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub operator_id: OperatorId,
    pub parallelism: u32,
    pub max_parallelism: u32,
    pub chain_length: usize,
    /// Indexed by subtask.
    subtask_states: Vec<Option<SubtaskState>>,
}

impl TaskState {
    pub fn new(
        operator_id: OperatorId,
        parallelism: u32,
        max_parallelism: u32,
        chain_length: usize,
    ) -> Self {
        Self {
            operator_id,
            parallelism,
            max_parallelism,
            chain_length,
            subtask_states: vec![None; parallelism as usize],
        }
    }

    /// Record the state of one subtask.
    ///
    /// Errors if the index is not below the parallelism.
    pub fn put_state(&mut self, index: SubtaskIndex, state: SubtaskState) -> Result<()> {
        let slot = self
            .subtask_states
            .get_mut(index.0 as usize)
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "subtask index {index} out of bounds for operator {} with parallelism {}",
                    self.operator_id, self.parallelism
                ))
            })?;
        *slot = Some(state);
        Ok(())
    }

    pub fn state(&self, index: SubtaskIndex) -> Option<&SubtaskState> {
        self.subtask_states
            .get(index.0 as usize)
            .and_then(Option::as_ref)
    }

    pub fn states(&self) -> impl Iterator<Item = (SubtaskIndex, &SubtaskState)> {
        self.subtask_states
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SubtaskIndex(i as u32), s)))
    }

    pub fn number_collected_states(&self) -> usize {
        self.subtask_states.iter().flatten().count()
    }

    pub fn has_state(&self) -> bool {
        self.subtask_states.iter().flatten().any(SubtaskState::has_state)
    }

    /// Does any subtask have non-keyed state?
    pub fn has_legacy_state(&self) -> bool {
        self.subtask_states
            .iter()
            .flatten()
            .any(|s| !s.legacy_operator_state.is_empty())
    }
}

impl StateObject for TaskState {
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()> {
        let mut first_err = None;
        for state in self.subtask_states.iter().flatten() {
            if let Err(err) = state.discard_state(fs) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn state_size(&self) -> u64 {
        self.subtask_states
            .iter()
            .flatten()
            .map(StateObject::state_size)
            .sum()
    }
}

/// Everything needed to restore a job, as stored in the `_metadata`
/// file of a checkpoint or savepoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u32,
    pub job_id: JobId,
    pub checkpoint_id: CheckpointId,
    pub timestamp: DateTime<Utc>,
    pub kind: CheckpointKind,
    pub task_states: Vec<TaskState>,
}

impl CheckpointMetadata {
    pub fn task_state(&self, operator_id: OperatorId) -> Option<&TaskState> {
        self.task_states
            .iter()
            .find(|t| t.operator_id == operator_id)
    }

    /// Every state file referenced.
    pub fn file_paths(&self) -> BTreeSet<PathBuf> {
        self.task_states
            .iter()
            .flat_map(|t| t.states().flat_map(|(_, s)| s.file_paths()))
            .collect()
    }
}

impl StateObject for CheckpointMetadata {
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()> {
        let mut first_err = None;
        for task_state in &self.task_states {
            if let Err(err) = task_state.discard_state(fs) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn state_size(&self) -> u64 {
        self.task_states.iter().map(StateObject::state_size).sum()
    }
}

#[cfg(test)]
fn file_state(path: &str) -> SubtaskState {
    SubtaskState {
        legacy_operator_state: ChainedStateHandle::new(vec![
            Some(StreamStateHandle::File {
                path: PathBuf::from(path),
                offset: 0,
                length: 3,
            }),
            None,
        ]),
        managed_keyed_state: None,
    }
}

#[test]
fn put_state_rejects_index_out_of_bounds() {
    let mut state = TaskState::new(OperatorId(1), 2, 128, 2);
    state.put_state(SubtaskIndex(0), file_state("a")).unwrap();
    state.put_state(SubtaskIndex(1), SubtaskState::empty(2)).unwrap();
    assert!(state.put_state(SubtaskIndex(2), file_state("c")).is_err());
    assert_eq!(state.number_collected_states(), 2);
    assert!(state.has_state());
    assert!(state.has_legacy_state());
}

#[test]
fn metadata_json_shape() {
    let mut task_state = TaskState::new(OperatorId(1), 1, 128, 2);
    task_state.put_state(SubtaskIndex(0), file_state("x/op-0")).unwrap();
    let metadata = CheckpointMetadata {
        version: METADATA_VERSION,
        job_id: JobId(7),
        checkpoint_id: CheckpointId(3),
        timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        kind: CheckpointKind::Savepoint,
        task_states: vec![task_state],
    };
    let json = serde_json::to_string(&metadata).unwrap();
    assert!(json.contains(r#""kind":"savepoint""#));
    assert!(json.contains(r#""type":"file""#));
    let found: CheckpointMetadata = serde_json::from_str(&json).unwrap();
    assert_eq!(found, metadata);
    assert_eq!(
        found.file_paths().into_iter().collect::<Vec<_>>(),
        vec![PathBuf::from("x/op-0")]
    );
}
