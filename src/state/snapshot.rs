//! Keyed snapshot stream format.
//!
//! ```text
//! header:    magic "SFKG" | version u8 | state count u32
//!            | per state: name (u32 len + utf8) | kind u8
//! per group: key group u32 | payload len u64 | payload
//! payload:   per non-empty state: state index u16 | row count u32
//!                | per row: key | namespace | user key | value
//!                  (each u32 len + bytes)
//!            END u16
//! ```
//!
//! All integers are big endian. The handle records where each key
//! group starts so restore can read just the groups it needs.

use super::serializer::*;
use super::store::StateRow;
use super::StateKind;
use super::StateMetaInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;
use crate::storage::FileSystem;

const MAGIC: &[u8; 4] = b"SFKG";
const FORMAT_VERSION: u8 = 1;
const END_OF_KEY_GROUP: u16 = u16::MAX;
const GROUP_HEADER_LEN: u64 = 4 + 8;

/// Build an in-memory keyed snapshot of `range`.
///
/// `rows(state_index, key_group)` must return that state's rows in
/// that key group in row order.
pub(crate) fn write_key_groups<F>(
    range: KeyGroupRange,
    states: &[StateMetaInfo],
    mut rows: F,
) -> Result<KeyGroupsStateHandle>
where
    F: FnMut(usize, u32) -> Result<Vec<StateRow>>,
{
    if states.len() >= END_OF_KEY_GROUP as usize {
        return Err(Error::serialization(format!(
            "too many registered states to snapshot: {}",
            states.len()
        )));
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&(states.len() as u32).to_be_bytes());
    for meta in states {
        write_len_prefixed(meta.name.as_bytes(), &mut out);
        out.push(meta.kind.as_u8());
    }
    let header_length = out.len() as u64;

    let mut offsets = Vec::with_capacity(range.len());
    let mut payload = Vec::new();
    for key_group in range.iter() {
        offsets.push(out.len() as u64);
        payload.clear();
        for state_index in 0..states.len() {
            let group_rows = rows(state_index, key_group)?;
            if group_rows.is_empty() {
                continue;
            }
            payload.extend_from_slice(&(state_index as u16).to_be_bytes());
            payload.extend_from_slice(&(group_rows.len() as u32).to_be_bytes());
            for row in &group_rows {
                write_len_prefixed(&row.key, &mut payload);
                write_len_prefixed(&row.namespace, &mut payload);
                write_len_prefixed(&row.user_key, &mut payload);
                write_len_prefixed(&row.value, &mut payload);
            }
        }
        payload.extend_from_slice(&END_OF_KEY_GROUP.to_be_bytes());

        out.extend_from_slice(&key_group.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&payload);
    }

    Ok(KeyGroupsStateHandle {
        offsets: KeyGroupRangeOffsets::new(range, offsets)?,
        header_length,
        states: states.to_vec(),
        delegate: StreamStateHandle::Bytes { data: out },
    })
}

fn read_header(mut input: &[u8]) -> Result<Vec<StateMetaInfo>> {
    let input = &mut input;
    if take(input, MAGIC.len())? != MAGIC {
        return Err(Error::corrupt("keyed snapshot has bad magic"));
    }
    let version = read_u8(input)?;
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(format!(
            "unsupported keyed snapshot version {version}"
        )));
    }
    let count = read_u32(input)?;
    let mut states = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = String::from_utf8(read_len_prefixed(input)?.to_vec())
            .map_err(|err| Error::corrupt(format!("invalid state name: {err}")))?;
        let kind = StateKind::from_u8(read_u8(input)?)?;
        states.push(StateMetaInfo { name, kind });
    }
    Ok(states)
}

/// Reads key groups out of one keyed snapshot.
pub(crate) struct KeyGroupSnapshotReader<'a> {
    handle: &'a KeyGroupsStateHandle,
    fs: &'a dyn FileSystem,
    states: Vec<StateMetaInfo>,
}

impl<'a> KeyGroupSnapshotReader<'a> {
    /// Read and check the header.
    pub(crate) fn open(handle: &'a KeyGroupsStateHandle, fs: &'a dyn FileSystem) -> Result<Self> {
        let header = handle.delegate.read_range(fs, 0, handle.header_length)?;
        let states = read_header(&header)?;
        if states != handle.states {
            return Err(Error::corrupt(
                "keyed snapshot header does not match its handle",
            ));
        }
        Ok(Self { handle, fs, states })
    }

    pub(crate) fn states(&self) -> &[StateMetaInfo] {
        &self.states
    }

    /// Feed every row of every key group in both the handle and `range`
    /// to `sink(state_index, key_group, row)`.
    ///
    /// Returns the key groups that were read.
    pub(crate) fn read<F>(&self, range: KeyGroupRange, mut sink: F) -> Result<Vec<u32>>
    where
        F: FnMut(usize, u32, StateRow) -> Result<()>,
    {
        let mut read = Vec::new();
        for (key_group, offset) in self.handle.offsets.iter() {
            if !range.contains(key_group) {
                continue;
            }
            let group_header = self
                .handle
                .delegate
                .read_range(self.fs, offset, GROUP_HEADER_LEN)?;
            let input = &mut group_header.as_slice();
            let found_group = read_u32(input)?;
            if found_group != key_group {
                return Err(Error::corrupt(format!(
                    "expected key group {key_group} at offset {offset}, found {found_group}"
                )));
            }
            let payload_len = read_u64(input)?;
            let payload =
                self.handle
                    .delegate
                    .read_range(self.fs, offset + GROUP_HEADER_LEN, payload_len)?;
            self.read_payload(key_group, &payload, &mut sink)?;
            read.push(key_group);
        }
        Ok(read)
    }

    fn read_payload<F>(&self, key_group: u32, mut payload: &[u8], sink: &mut F) -> Result<()>
    where
        F: FnMut(usize, u32, StateRow) -> Result<()>,
    {
        let input = &mut payload;
        loop {
            let state_index = read_u16(input)?;
            if state_index == END_OF_KEY_GROUP {
                break;
            }
            if state_index as usize >= self.states.len() {
                return Err(Error::corrupt(format!(
                    "unknown state index {state_index} in key group {key_group}"
                )));
            }
            let count = read_u32(input)?;
            for _ in 0..count {
                let row = StateRow {
                    key: read_len_prefixed(input)?.to_vec(),
                    namespace: read_len_prefixed(input)?.to_vec(),
                    user_key: read_len_prefixed(input)?.to_vec(),
                    value: read_len_prefixed(input)?.to_vec(),
                };
                sink(state_index as usize, key_group, row)?;
            }
        }
        if !input.is_empty() {
            return Err(Error::corrupt(format!(
                "trailing bytes after key group {key_group}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
fn row(key: u8, value: u8) -> StateRow {
    StateRow {
        key: vec![key],
        namespace: vec![0],
        user_key: vec![],
        value: vec![value],
    }
}

#[test]
fn reads_only_requested_groups() {
    let states = vec![
        StateMetaInfo::new("a", StateKind::Value),
        StateMetaInfo::new("b", StateKind::Value),
    ];
    let handle = write_key_groups(KeyGroupRange::new(2, 5), &states, |state, kg| {
        Ok(if state == 1 && kg % 2 == 0 {
            vec![row(kg as u8, 10), row(kg as u8 + 100, 11)]
        } else {
            vec![]
        })
    })
    .unwrap();

    let fs = crate::storage::LocalFileSystem;
    let reader = KeyGroupSnapshotReader::open(&handle, &fs).unwrap();
    assert_eq!(reader.states(), states.as_slice());
    let mut found = Vec::new();
    let groups = reader
        .read(KeyGroupRange::new(3, 4), |state, kg, row| {
            found.push((state, kg, row.key[0]));
            Ok(())
        })
        .unwrap();
    assert_eq!(groups, vec![3, 4]);
    assert_eq!(found, vec![(1, 4, 4), (1, 4, 104)]);
}

#[test]
fn corrupt_header_is_rejected() {
    let mut handle =
        write_key_groups(KeyGroupRange::new(0, 0), &[], |_, _| Ok(vec![])).unwrap();
    if let StreamStateHandle::Bytes { data } = &mut handle.delegate {
        data[0] = b'X';
    }
    let fs = crate::storage::LocalFileSystem;
    let err = KeyGroupSnapshotReader::open(&handle, &fs).err().unwrap();
    assert!(matches!(err, Error::CorruptState(_)));
}
