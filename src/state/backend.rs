//! Keyed state backend.
//!
//! The backend scopes every state access to the current key, which the
//! task sets before handing each record to an operator. State kinds
//! are layered over a [`StateStore`] by the accessors [`ValueState`],
//! [`ListState`] and [`MapState`], so the same backend code runs on the
//! heap and on the embedded database.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::instrument;

use super::heap::HeapStore;
use super::serializer::*;
use super::snapshot::KeyGroupSnapshotReader;
use super::sqlite::SqliteStore;
use super::store::*;
use super::*;
use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;
use crate::query;
use crate::storage::FileSystem;

#[derive(Debug)]
struct CurrentKey {
    key: Vec<u8>,
    key_group: u32,
}

/// Keyed state of one subtask, covering its key group range.
pub struct KeyedStateBackend<K> {
    key_serializer: Arc<dyn TypeSerializer<K>>,
    max_parallelism: u32,
    key_group_range: KeyGroupRange,
    current: Option<CurrentKey>,
    store: Box<dyn StateStore>,
}

impl<K> std::fmt::Debug for KeyedStateBackend<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedStateBackend")
            .field("store", &self.store.name())
            .field("key_group_range", &self.key_group_range)
            .field("states", &self.store.registered_states())
            .finish()
    }
}

impl<K> KeyedStateBackend<K> {
    pub fn new(
        key_serializer: impl TypeSerializer<K> + 'static,
        max_parallelism: u32,
        key_group_range: KeyGroupRange,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            key_serializer: Arc::new(key_serializer),
            max_parallelism,
            key_group_range,
            current: None,
            store,
        }
    }

    pub fn heap(
        key_serializer: impl TypeSerializer<K> + 'static,
        max_parallelism: u32,
        key_group_range: KeyGroupRange,
    ) -> Self {
        Self::new(
            key_serializer,
            max_parallelism,
            key_group_range,
            Box::new(HeapStore::new()),
        )
    }

    pub fn sqlite(
        key_serializer: impl TypeSerializer<K> + 'static,
        max_parallelism: u32,
        key_group_range: KeyGroupRange,
        instance_dir: &Path,
    ) -> Result<Self> {
        Ok(Self::new(
            key_serializer,
            max_parallelism,
            key_group_range,
            Box::new(SqliteStore::open(instance_dir)?),
        ))
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.key_group_range
    }

    pub fn max_parallelism(&self) -> u32 {
        self.max_parallelism
    }

    pub fn registered_states(&self) -> &[StateMetaInfo] {
        self.store.registered_states()
    }

    /// Scope all following state accesses to `key`.
    ///
    /// Errors if the key belongs to a key group this backend does not
    /// own.
    pub fn set_current_key(&mut self, key: &K) -> Result<()> {
        let key = to_bytes(self.key_serializer.as_ref(), key);
        self.set_current_key_bytes(key)
    }

    /// Like [`KeyedStateBackend::set_current_key`] with an already
    /// serialized key.
    pub fn set_current_key_bytes(&mut self, key: Vec<u8>) -> Result<()> {
        let key_group = assign_to_key_group(&key, self.max_parallelism);
        if !self.key_group_range.contains(key_group) {
            return Err(Error::KeyGroupOutOfRange {
                key_group,
                range: self.key_group_range.to_string(),
            });
        }
        self.current = Some(CurrentKey { key, key_group });
        Ok(())
    }

    pub fn current_key_group(&self) -> Option<u32> {
        self.current.as_ref().map(|c| c.key_group)
    }

    /// Register a state, or check an existing registration matches.
    pub fn get_or_create_state(&mut self, meta: &StateMetaInfo) -> Result<()> {
        match self
            .store
            .registered_states()
            .iter()
            .find(|m| m.name == meta.name)
        {
            Some(existing) if existing.kind != meta.kind => Err(Error::StateKindMismatch {
                name: meta.name.clone(),
                existing: existing.kind.to_string(),
                requested: meta.kind.to_string(),
            }),
            Some(_) => Ok(()),
            None => self.store.register_state(meta),
        }
    }

    fn scoped<'a>(
        &'a mut self,
        meta: StateMetaInfo,
        namespace: &'a Namespace,
    ) -> Result<ScopedStore<'a>> {
        self.get_or_create_state(&meta)?;
        let current = self.current.as_ref().ok_or(Error::NoCurrentKey)?;
        Ok(ScopedStore {
            store: &mut self.store,
            name: meta.name,
            prefix: RowPrefix {
                key_group: current.key_group,
                key: &current.key,
                namespace: namespace.as_bytes(),
            },
        })
    }

    pub fn get_or_create_value_state<'a, V>(
        &'a mut self,
        namespace: &'a Namespace,
        descriptor: &'a ValueStateDescriptor<V>,
    ) -> Result<ValueState<'a, V>> {
        Ok(ValueState {
            scoped: self.scoped(descriptor.meta(), namespace)?,
            descriptor,
        })
    }

    pub fn get_or_create_list_state<'a, T>(
        &'a mut self,
        namespace: &'a Namespace,
        descriptor: &'a ListStateDescriptor<T>,
    ) -> Result<ListState<'a, T>> {
        Ok(ListState {
            scoped: self.scoped(descriptor.meta(), namespace)?,
            descriptor,
        })
    }

    pub fn get_or_create_map_state<'a, UK, V>(
        &'a mut self,
        namespace: &'a Namespace,
        descriptor: &'a MapStateDescriptor<UK, V>,
    ) -> Result<MapState<'a, UK, V>> {
        Ok(MapState {
            scoped: self.scoped(descriptor.meta(), namespace)?,
            descriptor,
        })
    }

    /// Look up state for a serialized key and namespace and return it
    /// in the queryable wire format.
    ///
    /// Returns [`None`] if nothing is stored for that key and
    /// namespace.
    pub fn get_serialized_value<N>(
        &self,
        state_name: &str,
        serialized_key_and_namespace: &[u8],
        namespace_serializer: &dyn TypeSerializer<N>,
    ) -> Result<Option<Vec<u8>>> {
        let (key, namespace) = query::split_key_and_namespace(
            serialized_key_and_namespace,
            self.key_serializer.as_ref(),
            namespace_serializer,
        )?;
        let key_group = assign_to_key_group(key, self.max_parallelism);
        if !self.key_group_range.contains(key_group) {
            return Err(Error::KeyGroupOutOfRange {
                key_group,
                range: self.key_group_range.to_string(),
            });
        }
        let meta = self
            .store
            .registered_states()
            .iter()
            .find(|m| m.name == state_name)
            .ok_or_else(|| Error::UnknownState(state_name.to_owned()))?;
        let prefix = RowPrefix {
            key_group,
            key,
            namespace,
        };
        let rows = self.store.scan(&meta.name, prefix)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let serialized = match meta.kind {
            StateKind::Value => rows.into_iter().next().map(|(_, value)| value),
            StateKind::List => Some(query::concat_raw_list(
                rows.iter().map(|(_, value)| value.as_slice()),
            )),
            StateKind::Map => Some(query::concat_raw_map_entries(
                rows.iter()
                    .map(|(user_key, value)| (user_key.as_slice(), Some(value.as_slice()))),
            )),
        };
        Ok(serialized)
    }

    /// Write every key group this backend owns into a keyed snapshot.
    #[instrument(skip(self), fields(store = self.store.name(), range = %self.key_group_range))]
    pub fn snapshot(&mut self, checkpoint_id: CheckpointId) -> Result<KeyGroupsStateHandle> {
        self.store.snapshot(checkpoint_id, self.key_group_range)
    }

    /// Load the key groups this backend owns out of `handles`.
    ///
    /// Together the handles must cover this backend's range exactly
    /// once; groups outside of it are skipped.
    #[instrument(skip_all, fields(store = self.store.name(), range = %self.key_group_range))]
    pub fn restore(&mut self, handles: &[KeyGroupsStateHandle], fs: &dyn FileSystem) -> Result<()> {
        let range = self.key_group_range;
        let mut seen = BTreeSet::new();
        for handle in handles {
            let reader = KeyGroupSnapshotReader::open(handle, fs)?;
            for meta in reader.states() {
                self.get_or_create_state(meta)?;
            }
            let names: Vec<&str> = reader.states().iter().map(|m| m.name.as_str()).collect();
            let store = &mut self.store;
            let groups = reader.read(range, |state_index, key_group, row| {
                let prefix = RowPrefix {
                    key_group,
                    key: &row.key,
                    namespace: &row.namespace,
                };
                store.put(names[state_index], prefix, &row.user_key, &row.value)
            })?;
            for key_group in groups {
                if !seen.insert(key_group) {
                    return Err(Error::Restore(format!(
                        "key group {key_group} is in more than one restored handle"
                    )));
                }
            }
        }
        if let Some(missing) = range.iter().find(|kg| !seen.contains(kg)) {
            return Err(Error::Restore(format!(
                "restored handles do not cover key group {missing} of {range}"
            )));
        }
        tracing::debug!("Restored {} key groups", seen.len());
        Ok(())
    }

    /// Release the underlying store.
    pub fn dispose(self) -> Result<()> {
        self.store.dispose()
    }
}

/// Rows of one state under the current key and a namespace.
struct ScopedStore<'a> {
    store: &'a mut Box<dyn StateStore>,
    name: String,
    prefix: RowPrefix<'a>,
}

impl ScopedStore<'_> {
    fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get(&self.name, self.prefix, user_key)
    }

    fn put(&mut self, user_key: &[u8], value: &[u8]) -> Result<()> {
        self.store.put(&self.name, self.prefix, user_key, value)
    }

    fn delete(&mut self, user_key: &[u8]) -> Result<()> {
        self.store.delete(&self.name, self.prefix, user_key)
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.store.scan(&self.name, self.prefix)
    }

    fn clear(&mut self) -> Result<()> {
        self.store.delete_all(&self.name, self.prefix)
    }
}

/// A single value for the current key.
pub struct ValueState<'a, V> {
    scoped: ScopedStore<'a>,
    descriptor: &'a ValueStateDescriptor<V>,
}

impl<V: Clone> ValueState<'_, V> {
    /// The stored value, or the descriptor's default.
    pub fn value(&self) -> Result<Option<V>> {
        match self.scoped.get(&[])? {
            Some(bytes) => from_bytes(self.descriptor.serializer.as_ref(), &bytes).map(Some),
            None => Ok(self.descriptor.default_value.clone()),
        }
    }
}

impl<V> ValueState<'_, V> {
    pub fn update(&mut self, value: &V) -> Result<()> {
        let bytes = to_bytes(self.descriptor.serializer.as_ref(), value);
        self.scoped.put(&[], &bytes)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.scoped.delete(&[])
    }
}

/// An ordered list for the current key.
///
/// Elements are stored under a big endian sequence number, so they
/// come back in insertion order.
pub struct ListState<'a, T> {
    scoped: ScopedStore<'a>,
    descriptor: &'a ListStateDescriptor<T>,
}

impl<T> ListState<'_, T> {
    pub fn get(&self) -> Result<Vec<T>> {
        self.scoped
            .scan()?
            .iter()
            .map(|(_, bytes)| from_bytes(self.descriptor.element_serializer.as_ref(), bytes))
            .collect()
    }

    pub fn add(&mut self, element: &T) -> Result<()> {
        let next = match self
            .scoped
            .store
            .last_user_key(&self.scoped.name, self.scoped.prefix)?
        {
            Some(last) => {
                let mut input = last.as_slice();
                read_u64(&mut input)? + 1
            }
            None => 0,
        };
        let bytes = to_bytes(self.descriptor.element_serializer.as_ref(), element);
        self.scoped.put(&next.to_be_bytes(), &bytes)
    }

    /// Replace the whole list.
    pub fn update(&mut self, elements: &[T]) -> Result<()> {
        self.scoped.clear()?;
        for (seq, element) in elements.iter().enumerate() {
            let bytes = to_bytes(self.descriptor.element_serializer.as_ref(), element);
            self.scoped.put(&(seq as u64).to_be_bytes(), &bytes)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.scoped.clear()
    }
}

/// A map for the current key.
pub struct MapState<'a, UK, V> {
    scoped: ScopedStore<'a>,
    descriptor: &'a MapStateDescriptor<UK, V>,
}

impl<UK, V> MapState<'_, UK, V> {
    fn user_key(&self, key: &UK) -> Vec<u8> {
        to_bytes(self.descriptor.key_serializer.as_ref(), key)
    }

    pub fn get(&self, key: &UK) -> Result<Option<V>> {
        self.scoped
            .get(&self.user_key(key))?
            .map(|bytes| from_bytes(self.descriptor.value_serializer.as_ref(), &bytes))
            .transpose()
    }

    pub fn contains(&self, key: &UK) -> Result<bool> {
        Ok(self.scoped.get(&self.user_key(key))?.is_some())
    }

    pub fn put(&mut self, key: &UK, value: &V) -> Result<()> {
        let user_key = self.user_key(key);
        let bytes = to_bytes(self.descriptor.value_serializer.as_ref(), value);
        self.scoped.put(&user_key, &bytes)
    }

    pub fn remove(&mut self, key: &UK) -> Result<()> {
        let user_key = self.user_key(key);
        self.scoped.delete(&user_key)
    }

    /// All entries ordered by serialized key.
    pub fn entries(&self) -> Result<Vec<(UK, V)>> {
        self.scoped
            .scan()?
            .iter()
            .map(|(user_key, bytes)| {
                Ok((
                    from_bytes(self.descriptor.key_serializer.as_ref(), user_key)?,
                    from_bytes(self.descriptor.value_serializer.as_ref(), bytes)?,
                ))
            })
            .collect()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.scoped.scan()?.is_empty())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.scoped.clear()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::storage::LocalFileSystem;

    fn backends(dir: &Path, range: KeyGroupRange) -> Vec<KeyedStateBackend<i64>> {
        vec![
            KeyedStateBackend::heap(I64Serializer, 128, range),
            KeyedStateBackend::sqlite(I64Serializer, 128, range, &dir.join("sqlite")).unwrap(),
        ]
    }

    fn owned_keys(range: KeyGroupRange, n: usize) -> Vec<i64> {
        (0..)
            .filter(|k: &i64| range.contains(assign_to_key_group(&to_bytes(&I64Serializer, k), 128)))
            .take(n)
            .collect()
    }

    #[test]
    fn value_state_is_scoped_to_key_and_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ValueStateDescriptor::new("count", I64Serializer).with_default(0);
        let ns_a = Namespace::new(&1i32, &I32Serializer);
        let ns_b = Namespace::new(&2i32, &I32Serializer);
        for mut backend in backends(dir.path(), KeyGroupRange::all(128)) {
            backend.set_current_key(&1).unwrap();
            backend
                .get_or_create_value_state(&ns_a, &desc)
                .unwrap()
                .update(&5)
                .unwrap();
            assert_eq!(
                backend
                    .get_or_create_value_state(&ns_b, &desc)
                    .unwrap()
                    .value()
                    .unwrap(),
                Some(0)
            );
            backend.set_current_key(&2).unwrap();
            assert_eq!(
                backend
                    .get_or_create_value_state(&ns_a, &desc)
                    .unwrap()
                    .value()
                    .unwrap(),
                Some(0)
            );
            backend.set_current_key(&1).unwrap();
            let mut state = backend.get_or_create_value_state(&ns_a, &desc).unwrap();
            assert_eq!(state.value().unwrap(), Some(5));
            state.clear().unwrap();
            assert_eq!(state.value().unwrap(), Some(0));
            backend.dispose().unwrap();
        }
    }

    #[test]
    fn state_kind_mismatch_errors() {
        let mut backend = KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::all(128));
        backend.set_current_key(&1).unwrap();
        let ns = Namespace::void();
        let value = ValueStateDescriptor::new("s", I64Serializer);
        let list = ListStateDescriptor::new("s", I64Serializer);
        backend.get_or_create_value_state(&ns, &value).unwrap();
        assert!(matches!(
            backend.get_or_create_list_state(&ns, &list).err().unwrap(),
            Error::StateKindMismatch { .. }
        ));
    }

    #[test]
    fn access_without_key_errors() {
        let mut backend = KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::all(128));
        let ns = Namespace::void();
        let desc = ValueStateDescriptor::new("s", I64Serializer);
        assert!(matches!(
            backend.get_or_create_value_state(&ns, &desc).err().unwrap(),
            Error::NoCurrentKey
        ));
    }

    #[test]
    fn foreign_keys_are_rejected() {
        let range = KeyGroupRange::for_subtask(128, 4, 1);
        let mut backend = KeyedStateBackend::heap(I64Serializer, 128, range);
        let foreign = owned_keys(KeyGroupRange::for_subtask(128, 4, 0), 1)[0];
        assert!(matches!(
            backend.set_current_key(&foreign),
            Err(Error::KeyGroupOutOfRange { .. })
        ));
    }

    #[test]
    fn list_and_map_state() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Namespace::void();
        let list = ListStateDescriptor::new("list", I64Serializer);
        let map = MapStateDescriptor::new("map", I64Serializer, StringSerializer);
        for mut backend in backends(dir.path(), KeyGroupRange::all(128)) {
            backend.set_current_key(&7).unwrap();
            let mut state = backend.get_or_create_list_state(&ns, &list).unwrap();
            for i in [3, 1, 2] {
                state.add(&i).unwrap();
            }
            assert_eq!(state.get().unwrap(), vec![3, 1, 2]);
            state.update(&[9]).unwrap();
            state.add(&8).unwrap();
            assert_eq!(state.get().unwrap(), vec![9, 8]);

            let mut state = backend.get_or_create_map_state(&ns, &map).unwrap();
            state.put(&2, &"two".to_owned()).unwrap();
            state.put(&1, &"one".to_owned()).unwrap();
            assert!(state.contains(&1).unwrap());
            assert_eq!(state.get(&2).unwrap(), Some("two".to_owned()));
            state.remove(&2).unwrap();
            assert_eq!(state.entries().unwrap(), vec![(1, "one".to_owned())]);
            state.clear().unwrap();
            assert!(state.is_empty().unwrap());
            backend.dispose().unwrap();
        }
    }

    fn fill(backend: &mut KeyedStateBackend<i64>, keys: &[i64]) {
        let ns = Namespace::void();
        let value = ValueStateDescriptor::new("value", I64Serializer);
        let list = ListStateDescriptor::new("list", StringSerializer);
        for key in keys {
            backend.set_current_key(key).unwrap();
            backend
                .get_or_create_value_state(&ns, &value)
                .unwrap()
                .update(&(key * 10))
                .unwrap();
            let mut state = backend.get_or_create_list_state(&ns, &list).unwrap();
            state.add(&format!("a{key}")).unwrap();
            state.add(&format!("b{key}")).unwrap();
        }
    }

    fn bytes_of(handle: &KeyGroupsStateHandle) -> Vec<u8> {
        handle.delegate.read_all(&LocalFileSystem).unwrap()
    }

    #[test]
    fn heap_and_sqlite_snapshots_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let keys: Vec<i64> = (0..50).collect();
        let mut snapshots = Vec::new();
        for mut backend in backends(dir.path(), KeyGroupRange::all(128)) {
            fill(&mut backend, &keys);
            snapshots.push(bytes_of(&backend.snapshot(CheckpointId(1)).unwrap()));
            backend.dispose().unwrap();
        }
        assert_eq!(snapshots[0], snapshots[1]);
    }

    #[test]
    fn restore_then_snapshot_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let range = KeyGroupRange::all(128);
        for (i, mut backend) in backends(dir.path(), range).into_iter().enumerate() {
            fill(&mut backend, &(0..30).collect::<Vec<_>>());
            let handle = backend.snapshot(CheckpointId(1)).unwrap();
            backend.dispose().unwrap();

            let mut restored = if i == 0 {
                KeyedStateBackend::heap(I64Serializer, 128, range)
            } else {
                KeyedStateBackend::sqlite(I64Serializer, 128, range, &dir.path().join("again"))
                    .unwrap()
            };
            restored
                .restore(std::slice::from_ref(&handle), &LocalFileSystem)
                .unwrap();
            let again = restored.snapshot(CheckpointId(2)).unwrap();
            assert_eq!(bytes_of(&handle), bytes_of(&again));
            restored.dispose().unwrap();
        }
    }

    #[test]
    fn rescale_two_to_three_keeps_every_key() {
        let keys: Vec<i64> = (0..200).collect();
        let value = ValueStateDescriptor::new("value", I64Serializer);
        let ns = Namespace::void();

        let mut handles = Vec::new();
        for range in KeyGroupRange::all_for_parallelism(128, 2) {
            let mut backend = KeyedStateBackend::heap(I64Serializer, 128, range);
            let owned: Vec<i64> = keys
                .iter()
                .copied()
                .filter(|k| range.contains(assign_to_key_group(&to_bytes(&I64Serializer, k), 128)))
                .collect();
            fill(&mut backend, &owned);
            handles.push(backend.snapshot(CheckpointId(1)).unwrap());
        }

        let mut found = HashMap::new();
        for range in KeyGroupRange::all_for_parallelism(128, 3) {
            let subset: Vec<KeyGroupsStateHandle> =
                handles.iter().filter_map(|h| h.intersection(&range).unwrap()).collect();
            let mut backend = KeyedStateBackend::heap(I64Serializer, 128, range);
            backend.restore(&subset, &LocalFileSystem).unwrap();
            for key in &keys {
                if backend.set_current_key(key).is_ok() {
                    let v = backend
                        .get_or_create_value_state(&ns, &value)
                        .unwrap()
                        .value()
                        .unwrap();
                    assert!(found.insert(*key, v).is_none());
                }
            }
        }
        assert_eq!(found.len(), keys.len());
        assert!(found.iter().all(|(k, v)| *v == Some(k * 10)));
    }

    #[test]
    fn restore_checks_coverage() {
        let mut source = KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::new(0, 63));
        fill(&mut source, &owned_keys(KeyGroupRange::new(0, 63), 10));
        let handle = source.snapshot(CheckpointId(1)).unwrap();

        let mut gap = KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::new(0, 127));
        assert!(matches!(
            gap.restore(std::slice::from_ref(&handle), &LocalFileSystem),
            Err(Error::Restore(_))
        ));

        let mut overlap = KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::new(0, 63));
        assert!(matches!(
            overlap.restore(&[handle.clone(), handle], &LocalFileSystem),
            Err(Error::Restore(_))
        ));
    }

    #[test]
    fn serialized_value_lookup() {
        let desc = ValueStateDescriptor::new("v", I64Serializer);
        let mut backend = KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::all(128));
        backend.set_current_key(&4).unwrap();
        backend
            .get_or_create_value_state(&Namespace::void(), &desc)
            .unwrap()
            .update(&99)
            .unwrap();
        let kn = query::serialize_key_and_namespace(
            &4i64,
            &I64Serializer,
            &VoidNamespace,
            &VoidNamespaceSerializer,
        );
        let found = backend
            .get_serialized_value("v", &kn, &VoidNamespaceSerializer)
            .unwrap()
            .unwrap();
        assert_eq!(query::deserialize_value(&found, &I64Serializer).unwrap(), 99);

        let missing = query::serialize_key_and_namespace(
            &5i64,
            &I64Serializer,
            &VoidNamespace,
            &VoidNamespaceSerializer,
        );
        assert_eq!(
            backend
                .get_serialized_value("v", &missing, &VoidNamespaceSerializer)
                .unwrap(),
            None
        );
        assert!(matches!(
            backend.get_serialized_value("nope", &kn, &VoidNamespaceSerializer),
            Err(Error::UnknownState(_))
        ));
    }
}
