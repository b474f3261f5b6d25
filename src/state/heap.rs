//! In-memory state store.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::snapshot::write_key_groups;
use super::store::*;
use super::StateMetaInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;

type RowId = (Vec<u8>, Vec<u8>, Vec<u8>);

#[derive(Debug, Default)]
struct HeapTable {
    groups: HashMap<u32, BTreeMap<RowId, Vec<u8>>>,
}

impl HeapTable {
    fn rows_under<'a>(
        &'a self,
        prefix: RowPrefix<'a>,
    ) -> impl Iterator<Item = (&'a RowId, &'a Vec<u8>)> + 'a {
        let start: RowId = (prefix.key.to_vec(), prefix.namespace.to_vec(), Vec::new());
        self.groups
            .get(&prefix.key_group)
            .into_iter()
            .flat_map(move |rows| rows.range(start.clone()..))
            .take_while(move |((key, namespace, _), _)| {
                key.as_slice() == prefix.key && namespace.as_slice() == prefix.namespace
            })
    }
}

/// Keeps all state in ordered maps, one per state and key group.
///
/// Snapshots copy the rows out synchronously.
#[derive(Debug, Default)]
pub struct HeapStore {
    metas: Vec<StateMetaInfo>,
    tables: Vec<HeapTable>,
    index: HashMap<String, usize>,
}

impl HeapStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, state: &str) -> Result<&HeapTable> {
        self.index
            .get(state)
            .map(|i| &self.tables[*i])
            .ok_or_else(|| Error::UnknownState(state.to_owned()))
    }

    fn table_mut(&mut self, state: &str) -> Result<&mut HeapTable> {
        match self.index.get(state) {
            Some(i) => Ok(&mut self.tables[*i]),
            None => Err(Error::UnknownState(state.to_owned())),
        }
    }
}

fn row_id(prefix: RowPrefix<'_>, user_key: &[u8]) -> RowId {
    (
        prefix.key.to_vec(),
        prefix.namespace.to_vec(),
        user_key.to_vec(),
    )
}

impl StateStore for HeapStore {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn register_state(&mut self, meta: &StateMetaInfo) -> Result<()> {
        if !self.index.contains_key(&meta.name) {
            self.index.insert(meta.name.clone(), self.metas.len());
            self.metas.push(meta.clone());
            self.tables.push(HeapTable::default());
        }
        Ok(())
    }

    fn registered_states(&self) -> &[StateMetaInfo] {
        &self.metas
    }

    fn get(&self, state: &str, prefix: RowPrefix<'_>, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.table(state)?;
        Ok(table
            .groups
            .get(&prefix.key_group)
            .and_then(|rows| rows.get(&row_id(prefix, user_key)))
            .cloned())
    }

    fn put(
        &mut self,
        state: &str,
        prefix: RowPrefix<'_>,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.table_mut(state)?
            .groups
            .entry(prefix.key_group)
            .or_default()
            .insert(row_id(prefix, user_key), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, state: &str, prefix: RowPrefix<'_>, user_key: &[u8]) -> Result<()> {
        let table = self.table_mut(state)?;
        if let Some(rows) = table.groups.get_mut(&prefix.key_group) {
            rows.remove(&row_id(prefix, user_key));
            if rows.is_empty() {
                table.groups.remove(&prefix.key_group);
            }
        }
        Ok(())
    }

    fn scan(&self, state: &str, prefix: RowPrefix<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .table(state)?
            .rows_under(prefix)
            .map(|((_, _, user_key), value)| (user_key.clone(), value.clone()))
            .collect())
    }

    fn last_user_key(&self, state: &str, prefix: RowPrefix<'_>) -> Result<Option<Vec<u8>>> {
        Ok(self
            .table(state)?
            .rows_under(prefix)
            .last()
            .map(|((_, _, user_key), _)| user_key.clone()))
    }

    fn delete_all(&mut self, state: &str, prefix: RowPrefix<'_>) -> Result<()> {
        let doomed: Vec<RowId> = self
            .table(state)?
            .rows_under(prefix)
            .map(|(id, _)| id.clone())
            .collect();
        let table = self.table_mut(state)?;
        if let Some(rows) = table.groups.get_mut(&prefix.key_group) {
            for id in &doomed {
                rows.remove(id);
            }
            if rows.is_empty() {
                table.groups.remove(&prefix.key_group);
            }
        }
        Ok(())
    }

    fn snapshot(
        &mut self,
        _checkpoint_id: CheckpointId,
        range: KeyGroupRange,
    ) -> Result<KeyGroupsStateHandle> {
        let tables = &self.tables;
        write_key_groups(range, &self.metas, |state_index, key_group| {
            Ok(tables[state_index]
                .groups
                .get(&key_group)
                .map(|rows| {
                    rows.iter()
                        .map(|((key, namespace, user_key), value)| StateRow {
                            key: key.clone(),
                            namespace: namespace.clone(),
                            user_key: user_key.clone(),
                            value: value.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
fn prefix(key: &[u8]) -> RowPrefix<'_> {
    RowPrefix {
        key_group: 3,
        key,
        namespace: &[0],
    }
}

#[test]
fn scan_stays_within_prefix() {
    let mut store = HeapStore::new();
    store
        .register_state(&StateMetaInfo::new("s", super::StateKind::Map))
        .unwrap();
    store.put("s", prefix(b"a"), b"2", b"x").unwrap();
    store.put("s", prefix(b"a"), b"1", b"y").unwrap();
    store.put("s", prefix(b"ab"), b"1", b"z").unwrap();
    store.put("s", prefix(b""), b"1", b"w").unwrap();

    let found = store.scan("s", prefix(b"a")).unwrap();
    assert_eq!(
        found,
        vec![
            (b"1".to_vec(), b"y".to_vec()),
            (b"2".to_vec(), b"x".to_vec()),
        ]
    );
    assert_eq!(
        store.last_user_key("s", prefix(b"a")).unwrap(),
        Some(b"2".to_vec())
    );

    store.delete_all("s", prefix(b"a")).unwrap();
    assert!(store.scan("s", prefix(b"a")).unwrap().is_empty());
    assert_eq!(store.scan("s", prefix(b"ab")).unwrap().len(), 1);
}

#[test]
fn unknown_state_errors() {
    let store = HeapStore::new();
    assert!(matches!(
        store.get("nope", prefix(b"a"), b""),
        Err(Error::UnknownState(_))
    ));
}
