//! Distributed checkpoints and savepoints for a stream processing
//! engine.
//!
//! Jobs are graphs of parallel [`runtime::JobVertex`]es whose subtasks
//! keep non-keyed state and keyed state in a
//! [`state::KeyedStateBackend`]. The [`runtime::JobManager`] takes
//! consistent snapshots of all of it: periodic checkpoints for
//! recovery, and savepoints that a user triggers, keeps, restores a
//! changed job from, and finally disposes.
//!
//! Start everything at once with [`run::LocalCluster`].

pub mod config;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod query;
pub mod run;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod testing;
pub mod tracing;
pub mod webserver;

pub use errors::Error;
pub use errors::Result;
