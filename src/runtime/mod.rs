//! Running jobs and checkpointing them.
//!
//! A [`JobGraph`] is submitted to the [`JobManager`], which deploys one
//! [`StreamTask`] per subtask and drives checkpoints and savepoints
//! through a [`CheckpointCoordinator`].

pub(crate) mod coordinator;
pub(crate) mod graph;
pub(crate) mod job_manager;
pub(crate) mod operator;
pub(crate) mod restore;
pub(crate) mod task;

pub use coordinator::*;
pub use graph::*;
pub use job_manager::*;
pub use operator::*;
pub use restore::assign_state;
pub use task::*;
