//! What user code plugs into a task.
//!
//! A task runs one [`SourceFunction`] followed by a chain of
//! [`StreamOperator`]s. Both may keep opaque non-keyed state that is
//! snapshotted as bytes; chained operators may also use the keyed
//! state backend of their task.

use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;
use crate::state::to_bytes;
use crate::state::BytesSerializer;
use crate::state::KeyedStateBackend;

/// The keyed backend type tasks use. Record keys are its keys.
pub type TaskKeyedStateBackend = KeyedStateBackend<Vec<u8>>;

/// One item flowing through a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Which key group a record key belongs to.
pub fn record_key_group(key: &[u8], max_parallelism: u32) -> u32 {
    assign_to_key_group(&to_bytes(&BytesSerializer, &key.to_vec()), max_parallelism)
}

/// Who a running subtask is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskInfo {
    pub job_id: JobId,
    pub operator_id: OperatorId,
    pub vertex_name: String,
    pub subtask_index: SubtaskIndex,
    pub parallelism: u32,
    pub max_parallelism: u32,
    pub key_group_range: KeyGroupRange,
    /// Increases by one on every restart of the job.
    pub attempt: u32,
}

impl SubtaskInfo {
    /// Human readable name, also used for the task thread.
    pub fn task_name(&self) -> String {
        format!(
            "{} ({}/{})",
            self.vertex_name,
            self.subtask_index.0 + 1,
            self.parallelism
        )
    }

    /// Would a record with this key be accepted by this subtask's
    /// keyed state?
    pub fn owns_key(&self, key: &[u8]) -> bool {
        self.key_group_range
            .contains(record_key_group(key, self.max_parallelism))
    }
}

/// Result of asking a source for its next record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePoll {
    Ready(Record),
    /// Nothing right now; ask again later.
    Idle,
    /// The source is exhausted and the task will finish.
    Finished,
}

/// Produces the records of one subtask.
///
/// All calls happen under the task's checkpoint lock, so a snapshot
/// never sees a half emitted record.
pub trait SourceFunction: Send {
    fn open(&mut self, _info: &SubtaskInfo) -> Result<()> {
        Ok(())
    }

    fn poll_next(&mut self, info: &SubtaskInfo) -> Result<SourcePoll>;

    /// Non-keyed state to include in a checkpoint.
    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Called before [`SourceFunction::open`] with the bytes a previous
    /// snapshot returned.
    fn restore_state(&mut self, _info: &SubtaskInfo, _state: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handed to operators while they process a record.
pub struct OperatorContext<'a> {
    info: &'a SubtaskInfo,
    keyed: Option<&'a mut TaskKeyedStateBackend>,
    output: &'a mut Vec<Record>,
}

impl<'a> OperatorContext<'a> {
    pub(crate) fn new(
        info: &'a SubtaskInfo,
        keyed: Option<&'a mut TaskKeyedStateBackend>,
        output: &'a mut Vec<Record>,
    ) -> Self {
        Self {
            info,
            keyed,
            output,
        }
    }

    pub fn info(&self) -> &SubtaskInfo {
        self.info
    }

    /// Pass a record to the next operator in the chain.
    pub fn emit(&mut self, record: Record) {
        self.output.push(record);
    }

    /// The keyed backend, with the current key set to the key of the
    /// record being processed.
    pub fn keyed_state(&mut self) -> Result<&mut TaskKeyedStateBackend> {
        self.keyed.as_deref_mut().ok_or_else(|| {
            Error::Operator(format!(
                "vertex {:?} has no keyed state backend",
                self.info.vertex_name
            ))
        })
    }
}

/// Transforms records within a task.
pub trait StreamOperator: Send {
    fn open(&mut self, _info: &SubtaskInfo) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, record: Record, ctx: &mut OperatorContext<'_>) -> Result<()>;

    /// Non-keyed state to include in a checkpoint.
    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Called before [`StreamOperator::open`] with the bytes a
    /// previous snapshot returned.
    fn restore_state(&mut self, _info: &SubtaskInfo, _state: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn owns_key_matches_ranges() {
    let info = |i| SubtaskInfo {
        job_id: JobId(1),
        operator_id: OperatorId(1),
        vertex_name: "v".to_owned(),
        subtask_index: SubtaskIndex(i),
        parallelism: 3,
        max_parallelism: 16,
        key_group_range: KeyGroupRange::for_subtask(16, 3, i),
        attempt: 0,
    };
    let infos: Vec<SubtaskInfo> = (0..3).map(info).collect();
    for key in 0u32..100 {
        let owners = infos
            .iter()
            .filter(|i| i.owns_key(&key.to_be_bytes()))
            .count();
        assert_eq!(owners, 1);
    }
    assert_eq!(infos[1].task_name(), "v (2/3)");
}
