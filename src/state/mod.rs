//! Keyed state.
//!
//! Operators declare named state with a descriptor and access it
//! through the [`KeyedStateBackend`] of their subtask. The backend is
//! generic over where rows live: [`HeapStore`] keeps them in memory
//! and [`SqliteStore`] in an embedded database on local disk. Both
//! produce the same snapshot stream for the same contents, so a
//! snapshot taken by one can be restored into the other.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;

pub(crate) mod backend;
pub(crate) mod descriptor;
pub(crate) mod heap;
pub(crate) mod serializer;
pub(crate) mod snapshot;
pub(crate) mod sqlite;
pub(crate) mod store;

pub use backend::*;
pub use descriptor::*;
pub use heap::HeapStore;
pub use serializer::*;
pub use sqlite::SqliteStore;
pub use store::*;

/// Which store keyed backends of a vertex use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateBackendKind {
    Heap,
    /// One database per subtask instance within `base_dir`.
    Sqlite { base_dir: PathBuf },
}

impl StateBackendKind {
    /// Create the store for one backend instance.
    ///
    /// `instance` must be unique among concurrently running instances.
    pub fn create_store(&self, instance: &str) -> Result<Box<dyn StateStore>> {
        match self {
            Self::Heap => Ok(Box::new(HeapStore::new())),
            Self::Sqlite { base_dir } => Ok(Box::new(SqliteStore::open(
                &Path::new(base_dir).join(instance),
            )?)),
        }
    }
}
