//! The data model for checkpoints and savepoints.
//!
//! [`ids`] and [`key_group`] are the base, [`handle`] describes where
//! snapshotted bytes live, and [`checkpoint`] is built on top of those
//! to describe what a whole checkpoint or savepoint contains.

pub(crate) mod checkpoint;
pub(crate) mod handle;
pub(crate) mod ids;
pub(crate) mod key_group;

// Re-export so you can get the whole model at once.

pub use checkpoint::*;
pub use handle::*;
pub use ids::*;
pub use key_group::*;
