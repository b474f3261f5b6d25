//! Mapping the state in a checkpoint or savepoint onto the subtasks of
//! a (possibly changed) job.

use std::collections::HashMap;

use super::graph::JobGraph;
use super::task::TaskStateHandles;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::ResultExt;
use crate::model::*;
use crate::storage::FileSystem;

/// Work out what each subtask of `graph` restores from `metadata`.
///
/// Keyed state is redistributed by key group, so vertices may change
/// parallelism as long as max parallelism stays the same. Non-keyed
/// state can't be split and pins the parallelism. Every referenced
/// file must be readable, so a missing file fails here rather than in
/// a deployed task.
pub fn assign_state(
    graph: &JobGraph,
    metadata: &CheckpointMetadata,
    allow_non_restored_state: bool,
    fs: &dyn FileSystem,
) -> Result<HashMap<(OperatorId, SubtaskIndex), TaskStateHandles>> {
    let mut assignment = HashMap::new();
    for task_state in &metadata.task_states {
        let Some(vertex) = graph.vertex(task_state.operator_id) else {
            if allow_non_restored_state {
                tracing::info!(
                    "Skipping state of operator {} which is not in job {:?}",
                    task_state.operator_id,
                    graph.name
                );
                continue;
            }
            return Err(Error::Restore(format!(
                "checkpoint {} has state for operator {} which is not in job {:?}",
                metadata.checkpoint_id, task_state.operator_id, graph.name
            )));
        };

        if task_state.max_parallelism != vertex.max_parallelism {
            return Err(Error::Restore(format!(
                "max parallelism of {:?} changed from {} to {}",
                vertex.name, task_state.max_parallelism, vertex.max_parallelism
            )));
        }
        let has_legacy_state = task_state.has_legacy_state();
        if has_legacy_state && task_state.parallelism != vertex.parallelism {
            return Err(Error::Restore(format!(
                "{:?} has non-keyed state and can't change parallelism from {} to {}",
                vertex.name, task_state.parallelism, vertex.parallelism
            )));
        }
        if has_legacy_state && task_state.chain_length != vertex.chain_length() {
            return Err(Error::Restore(format!(
                "{:?} has non-keyed state for {} chained operators but now chains {}",
                vertex.name,
                task_state.chain_length,
                vertex.chain_length()
            )));
        }
        let has_keyed_state = task_state
            .states()
            .any(|(_, s)| s.managed_keyed_state.is_some());
        if has_keyed_state && vertex.keyed_backend.is_none() {
            return Err(Error::Restore(format!(
                "{:?} has keyed state but no keyed state backend",
                vertex.name
            )));
        }

        let ranges = KeyGroupRange::all_for_parallelism(vertex.max_parallelism, vertex.parallelism);
        for (index, range) in ranges.into_iter().enumerate() {
            let subtask_index = SubtaskIndex(index as u32);
            let legacy_operator_state = if has_legacy_state {
                task_state
                    .state(subtask_index)
                    .map(|s| s.legacy_operator_state.clone())
                    .filter(|chain| !chain.is_empty())
            } else {
                None
            };
            let mut keyed_state = Vec::new();
            for handle in task_state
                .states()
                .filter_map(|(_, s)| s.managed_keyed_state.as_ref())
            {
                if let Some(handle) = handle.intersection(&range)? {
                    keyed_state.push(handle);
                }
            }
            let handles = TaskStateHandles {
                legacy_operator_state,
                keyed_state,
            };
            if !handles.is_empty() {
                assignment.insert((vertex.operator_id, subtask_index), handles);
            }
        }
    }

    for handles in assignment.values() {
        check_readable(handles, fs)?;
    }
    Ok(assignment)
}

fn check_readable(handles: &TaskStateHandles, fs: &dyn FileSystem) -> Result<()> {
    let legacy = handles
        .legacy_operator_state
        .iter()
        .flat_map(|chain| chain.iter().flatten());
    let keyed = handles.keyed_state.iter().map(|k| &k.delegate);
    for handle in legacy.chain(keyed) {
        handle
            .check_readable(fs)
            .reraise("state referenced by checkpoint is not readable")?;
    }
    Ok(())
}
