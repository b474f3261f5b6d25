//! The storage seam under the keyed state backend.
//!
//! A store holds rows addressed by `(state, key_group, key, namespace,
//! user_key)`. Value state uses an empty user key, list state a big
//! endian sequence number and map state the serialized map key. Rows
//! within one key group are ordered by `(key, namespace, user_key)`
//! bytewise, in every store, so snapshots of equal contents are equal.

use crate::errors::Result;
use crate::model::CheckpointId;
use crate::model::KeyGroupRange;
use crate::model::KeyGroupsStateHandle;
use crate::state::StateMetaInfo;

/// Addresses every row for one key in one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPrefix<'a> {
    pub key_group: u32,
    pub key: &'a [u8],
    pub namespace: &'a [u8],
}

/// One stored row of one state in one key group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StateRow {
    pub key: Vec<u8>,
    pub namespace: Vec<u8>,
    pub user_key: Vec<u8>,
    pub value: Vec<u8>,
}

pub trait StateStore: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create the column family for a state if it doesn't exist.
    fn register_state(&mut self, meta: &StateMetaInfo) -> Result<()>;

    /// Registered states in registration order.
    fn registered_states(&self) -> &[StateMetaInfo];

    fn get(&self, state: &str, prefix: RowPrefix<'_>, user_key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(
        &mut self,
        state: &str,
        prefix: RowPrefix<'_>,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<()>;

    fn delete(&mut self, state: &str, prefix: RowPrefix<'_>, user_key: &[u8]) -> Result<()>;

    /// `(user_key, value)` for every row under `prefix`, ordered by
    /// user key.
    fn scan(&self, state: &str, prefix: RowPrefix<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// The largest user key under `prefix`.
    fn last_user_key(&self, state: &str, prefix: RowPrefix<'_>) -> Result<Option<Vec<u8>>>;

    fn delete_all(&mut self, state: &str, prefix: RowPrefix<'_>) -> Result<()>;

    /// Write every row in `range` into a self-contained keyed snapshot.
    ///
    /// Must reflect exactly the writes that happened before the call.
    fn snapshot(
        &mut self,
        checkpoint_id: CheckpointId,
        range: KeyGroupRange,
    ) -> Result<KeyGroupsStateHandle>;

    /// Release all resources and any on-disk files of this store.
    fn dispose(self: Box<Self>) -> Result<()>;
}
