//! State handles.
//!
//! A handle is a reference to snapshotted bytes. Handles are what
//! travel from tasks to the coordinator and end up in checkpoint
//! metadata; the bytes themselves stay where the task put them.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::KeyGroupRange;
use crate::errors::Error;
use crate::errors::Result;
use crate::state::StateMetaInfo;
use crate::storage::FileSystem;

/// Something that holds snapshotted state and can be thrown away.
pub trait StateObject {
    /// Delete any persisted bytes this handle owns.
    ///
    /// Already missing files are not an error.
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()>;

    /// Size of the referenced state in bytes.
    fn state_size(&self) -> u64;
}

/// Reference to a readable stream of bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamStateHandle {
    /// Small state inlined directly in the handle.
    Bytes { data: Vec<u8> },
    /// A byte range within a file.
    ///
    /// Several handles of one subtask can point into the same file.
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl StreamStateHandle {
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::Bytes { .. } => None,
            Self::File { path, .. } => Some(path),
        }
    }

    pub fn read_all(&self, fs: &dyn FileSystem) -> Result<Vec<u8>> {
        self.read_range(fs, 0, self.state_size())
    }

    /// Read `length` bytes starting `offset` bytes into this stream.
    pub fn read_range(&self, fs: &dyn FileSystem, offset: u64, length: u64) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.state_size())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "read of {length} bytes at {offset} past end of {} byte stream",
                    self.state_size()
                ))
            })?;
        match self {
            Self::Bytes { data } => Ok(data[offset as usize..end as usize].to_vec()),
            Self::File {
                path,
                offset: base,
                ..
            } => fs.read_range(path, base + offset, length),
        }
    }

    /// Error with [`Error::NotFound`] if the bytes are gone.
    pub fn check_readable(&self, fs: &dyn FileSystem) -> Result<()> {
        match self {
            Self::Bytes { .. } => Ok(()),
            Self::File { path, .. } if fs.exists(path) => Ok(()),
            Self::File { path, .. } => Err(Error::NotFound { path: path.clone() }),
        }
    }
}

impl StateObject for StreamStateHandle {
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()> {
        match self {
            Self::Bytes { .. } => Ok(()),
            Self::File { path, .. } => match fs.delete_file(path) {
                Err(err) if err.is_not_found() => Ok(()),
                res => res,
            },
        }
    }

    fn state_size(&self) -> u64 {
        match self {
            Self::Bytes { data } => data.len() as u64,
            Self::File { length, .. } => *length,
        }
    }
}

/// Where each key group's data starts within a keyed snapshot stream.
///
/// There is exactly one offset per key group in the range, also when
/// read back from metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawKeyGroupRangeOffsets")]
pub struct KeyGroupRangeOffsets {
    range: KeyGroupRange,
    offsets: Vec<u64>,
}

#[derive(Deserialize)]
struct RawKeyGroupRangeOffsets {
    range: KeyGroupRange,
    offsets: Vec<u64>,
}

impl TryFrom<RawKeyGroupRangeOffsets> for KeyGroupRangeOffsets {
    type Error = Error;

    fn try_from(raw: RawKeyGroupRangeOffsets) -> Result<Self> {
        Self::new(raw.range, raw.offsets)
    }
}

impl KeyGroupRangeOffsets {
    pub fn new(range: KeyGroupRange, offsets: Vec<u64>) -> Result<Self> {
        if offsets.len() != range.len() {
            return Err(Error::corrupt(format!(
                "{} offsets for key group range {range}",
                offsets.len()
            )));
        }
        Ok(Self { range, offsets })
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.range
    }

    pub fn get_offset(&self, key_group: u32) -> Option<u64> {
        if !self.range.contains(key_group) {
            return None;
        }
        self.offsets
            .get((key_group - self.range.start()) as usize)
            .copied()
    }

    pub fn intersection(&self, range: &KeyGroupRange) -> Result<Self> {
        let range = self.range.intersection(range);
        let offsets = range
            .iter()
            .filter_map(|kg| self.get_offset(kg))
            .collect();
        Self::new(range, offsets)
    }

    /// `(key_group, offset)` pairs in key group order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.range.iter().zip(self.offsets.iter().copied())
    }
}

/// The keyed state of one subtask, or a key group subset of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupsStateHandle {
    pub offsets: KeyGroupRangeOffsets,
    /// Length of the state catalog header at the start of `delegate`.
    pub header_length: u64,
    /// Registered states, in catalog order.
    pub states: Vec<StateMetaInfo>,
    pub delegate: StreamStateHandle,
}

impl KeyGroupsStateHandle {
    pub fn key_group_range(&self) -> KeyGroupRange {
        self.offsets.key_group_range()
    }

    /// The part of this handle covering `range`, if any.
    ///
    /// The returned handle shares the underlying stream.
    pub fn intersection(&self, range: &KeyGroupRange) -> Result<Option<Self>> {
        let offsets = self.offsets.intersection(range)?;
        if offsets.key_group_range().is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            offsets,
            header_length: self.header_length,
            states: self.states.clone(),
            delegate: self.delegate.clone(),
        }))
    }
}

impl StateObject for KeyGroupsStateHandle {
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()> {
        self.delegate.discard_state(fs)
    }

    fn state_size(&self) -> u64 {
        self.delegate.state_size()
    }
}

/// One optional handle per operator in a chain, in chain order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedStateHandle<T> {
    handles: Vec<Option<T>>,
}

impl<T> ChainedStateHandle<T> {
    pub fn new(handles: Vec<Option<T>>) -> Self {
        Self { handles }
    }

    pub fn wrap_single(handle: T) -> Self {
        Self::new(vec![Some(handle)])
    }

    /// Number of operators in the chain, stateful or not.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.handles.get(index).and_then(Option::as_ref)
    }

    /// True if no operator in the chain has state.
    pub fn is_empty(&self) -> bool {
        self.handles.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&T>> {
        self.handles.iter().map(Option::as_ref)
    }
}

impl<T: StateObject> StateObject for ChainedStateHandle<T> {
    fn discard_state(&self, fs: &dyn FileSystem) -> Result<()> {
        let mut first_err = None;
        for handle in self.handles.iter().flatten() {
            if let Err(err) = handle.discard_state(fs) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn state_size(&self) -> u64 {
        self.handles.iter().flatten().map(T::state_size).sum()
    }
}

#[test]
fn bytes_handle_range_reads() {
    let fs = crate::storage::LocalFileSystem;
    let handle = StreamStateHandle::Bytes {
        data: vec![1, 2, 3, 4, 5],
    };
    assert_eq!(handle.read_range(&fs, 1, 3).unwrap(), vec![2, 3, 4]);
    assert_eq!(handle.read_all(&fs).unwrap(), vec![1, 2, 3, 4, 5]);
    assert!(handle.read_range(&fs, 4, 2).is_err());
    assert!(handle.check_readable(&fs).is_ok());
}

#[test]
fn file_handle_reads_relative_to_its_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    std::fs::write(&path, b"headerBODYtrailer").unwrap();
    let fs = crate::storage::LocalFileSystem;
    let handle = StreamStateHandle::File {
        path: path.clone(),
        offset: 6,
        length: 4,
    };
    assert_eq!(handle.read_all(&fs).unwrap(), b"BODY".to_vec());
    assert_eq!(handle.read_range(&fs, 1, 2).unwrap(), b"OD".to_vec());

    handle.discard_state(&fs).unwrap();
    assert!(!path.exists());
    // Discarding twice is fine.
    handle.discard_state(&fs).unwrap();
    assert!(handle.check_readable(&fs).unwrap_err().is_not_found());
}

#[test]
fn offsets_intersection() {
    let offsets =
        KeyGroupRangeOffsets::new(KeyGroupRange::new(4, 7), vec![10, 20, 30, 40]).unwrap();
    let found = offsets.intersection(&KeyGroupRange::new(6, 100)).unwrap();
    assert_eq!(found.key_group_range(), KeyGroupRange::new(6, 7));
    assert_eq!(found.iter().collect::<Vec<_>>(), vec![(6, 30), (7, 40)]);
    assert_eq!(offsets.get_offset(3), None);

    assert!(KeyGroupRangeOffsets::new(KeyGroupRange::new(0, 1), vec![0]).is_err());
}

#[test]
fn offsets_from_json_must_cover_their_range() {
    let ok: KeyGroupRangeOffsets =
        serde_json::from_str(r#"{"range":{"start":0,"end":1},"offsets":[0,5]}"#).unwrap();
    assert_eq!(ok.get_offset(1), Some(5));

    let err = serde_json::from_str::<KeyGroupRangeOffsets>(
        r#"{"range":{"start":0,"end":7},"offsets":[9]}"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("1 offsets"), "{err}");
}

#[test]
fn chained_handle_emptiness() {
    let chained: ChainedStateHandle<StreamStateHandle> = ChainedStateHandle::new(vec![None, None]);
    assert!(chained.is_empty());
    assert_eq!(chained.len(), 2);

    let chained = ChainedStateHandle::new(vec![
        None,
        Some(StreamStateHandle::Bytes { data: vec![0; 3] }),
    ]);
    assert!(!chained.is_empty());
    assert_eq!(chained.state_size(), 3);
    assert!(chained.get(0).is_none());
    assert!(chained.get(1).is_some());
}
