//! Durable storage of checkpoint data.
//!
//! All persistence goes through the [`FileSystem`] trait so tests can
//! swap in one that fails on purpose. [`CheckpointStorage`] decides
//! where checkpoint and savepoint directories go, [`StateFileWriter`]
//! lays out one subtask's state streams in a single file, and
//! [`savepoint`] reads and writes the `_metadata` file.

use std::fmt::Debug;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::instrument;

use crate::errors::Error;
use crate::errors::Result;
use crate::errors::ResultExt;
use crate::errors::TriggerFailure;
use crate::model::*;

pub mod savepoint;

/// Minimal file system operations needed for checkpointing.
pub trait FileSystem: Debug + Send + Sync {
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Atomically replace the file at `path` with `data`.
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read exactly `length` bytes starting at `offset`.
    fn read_range(&self, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>>;

    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Delete a directory. If not `recursive`, it must be empty.
    fn delete_dir(&self, path: &Path, recursive: bool) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Entries directly within a directory, sorted.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

fn not_found_or(path: &Path, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound {
            path: path.to_owned(),
        }
    } else {
        Error::Io(err)
    }
}

/// The local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).reraise_with(|| format!("error creating {path:?}"))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".inprogress");
        let tmp_path = PathBuf::from(tmp_name);
        let res = File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(data)?;
                file.sync_all()
            })
            .and_then(|_| std::fs::rename(&tmp_path, path));
        if res.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        res.map_err(|err| not_found_or(path, err))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|err| not_found_or(path, err))
    }

    fn read_range(&self, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = File::open(path).map_err(|err| not_found_or(path, err))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; length as usize];
        file.read_exact(&mut buf).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                Error::corrupt(format!(
                    "{path:?} is shorter than {length} bytes at offset {offset}"
                ))
            } else {
                Error::Io(err)
            }
        })?;
        Ok(buf)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|err| not_found_or(path, err))
    }

    fn delete_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        if recursive {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_dir(path)
        }
        .map_err(|err| not_found_or(path, err))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(path)
            .map_err(|err| not_found_or(path, err))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }
}

/// A directory that one checkpoint or savepoint writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStorageLocation {
    pub kind: CheckpointKind,
    pub dir: PathBuf,
}

impl CheckpointStorageLocation {
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(savepoint::METADATA_FILE_NAME)
    }

    /// The single file all state streams of one subtask go into.
    pub fn state_file_path(&self, operator_id: OperatorId, subtask: SubtaskIndex) -> PathBuf {
        self.dir.join(format!("op-{operator_id}-{subtask}"))
    }
}

/// Decides where checkpoints and savepoints of jobs are written.
#[derive(Debug, Clone)]
pub struct CheckpointStorage {
    fs: Arc<dyn FileSystem>,
    checkpoint_root: PathBuf,
    default_savepoint_dir: Option<PathBuf>,
}

impl CheckpointStorage {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        checkpoint_root: PathBuf,
        default_savepoint_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            fs,
            checkpoint_root,
            default_savepoint_dir,
        }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Directory holding all periodic checkpoints of a job.
    pub fn job_checkpoint_dir(&self, job_id: JobId) -> PathBuf {
        self.checkpoint_root.join(job_id.to_string())
    }

    #[instrument(skip(self))]
    pub fn resolve_checkpoint_location(
        &self,
        job_id: JobId,
        checkpoint_id: CheckpointId,
    ) -> Result<CheckpointStorageLocation> {
        let dir = self
            .job_checkpoint_dir(job_id)
            .join(format!("chk-{checkpoint_id}"));
        self.fs.create_dir_all(&dir)?;
        Ok(CheckpointStorageLocation {
            kind: CheckpointKind::Checkpoint,
            dir,
        })
    }

    /// Create a fresh, uniquely named savepoint directory within
    /// `target_dir` or the configured default.
    #[instrument(skip(self))]
    pub fn resolve_savepoint_location(
        &self,
        job_id: JobId,
        target_dir: Option<&Path>,
    ) -> Result<CheckpointStorageLocation> {
        let target_dir = target_dir
            .or(self.default_savepoint_dir.as_deref())
            .ok_or(TriggerFailure::NoSavepointDirectory)?;
        let job_str = job_id.to_string();
        let job_prefix = &job_str[..6];
        let dir = loop {
            let candidate = target_dir.join(format!(
                "savepoint-{job_prefix}-{:012x}",
                fastrand::u64(..) & 0xffff_ffff_ffff
            ));
            if !self.fs.exists(&candidate) {
                break candidate;
            }
        };
        self.fs.create_dir_all(&dir)?;
        Ok(CheckpointStorageLocation {
            kind: CheckpointKind::Savepoint,
            dir,
        })
    }
}

/// Collects the state streams of one subtask and writes them as one
/// file, handing out a [`StreamStateHandle::File`] per stream.
///
/// The handles are only valid once [`StateFileWriter::finish`]
/// succeeds.
pub struct StateFileWriter {
    path: PathBuf,
    buf: Vec<u8>,
}

impl StateFileWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            buf: Vec::new(),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> StreamStateHandle {
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        StreamStateHandle::File {
            path: self.path.clone(),
            offset,
            length: bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write the file, trying up to `1 + retries` times.
    pub fn finish(self, fs: &dyn FileSystem, retries: u32) -> Result<PathBuf> {
        let mut attempt = 0;
        loop {
            match fs.write_file(&self.path, &self.buf) {
                Ok(()) => return Ok(self.path),
                Err(err) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Retrying write of state file {:?} after error: {err}",
                        self.path
                    );
                }
                Err(err) => {
                    return Err(err).reraise_with(|| {
                        format!("error writing state file {:?}", self.path)
                    })
                }
            }
        }
    }
}

#[test]
fn savepoint_locations_are_unique() {
    let dir = tempfile::tempdir().unwrap();
    let storage = CheckpointStorage::new(
        Arc::new(LocalFileSystem),
        dir.path().join("checkpoints"),
        None,
    );
    let job_id = JobId(0xabcdef << 104);
    let a = storage
        .resolve_savepoint_location(job_id, Some(dir.path()))
        .unwrap();
    let b = storage
        .resolve_savepoint_location(job_id, Some(dir.path()))
        .unwrap();
    assert_ne!(a.dir, b.dir);
    assert!(a.dir.is_dir());
    let name = a.dir.file_name().unwrap().to_str().unwrap().to_owned();
    assert!(name.starts_with("savepoint-0000ab-"), "{name}");

    let err = storage.resolve_savepoint_location(job_id, None).unwrap_err();
    assert!(matches!(
        err,
        Error::Trigger(TriggerFailure::NoSavepointDirectory)
    ));
}

#[test]
fn checkpoint_locations_are_per_job_and_id() {
    let dir = tempfile::tempdir().unwrap();
    let storage = CheckpointStorage::new(Arc::new(LocalFileSystem), dir.path().to_owned(), None);
    let loc = storage
        .resolve_checkpoint_location(JobId(1), CheckpointId(4))
        .unwrap();
    assert_eq!(
        loc.dir,
        dir.path()
            .join("00000000000000000000000000000001")
            .join("chk-4")
    );
    assert_eq!(loc.metadata_path(), loc.dir.join("_metadata"));
}

#[test]
fn state_file_writer_lays_out_streams() {
    let dir = tempfile::tempdir().unwrap();
    let fs = LocalFileSystem;
    let mut writer = StateFileWriter::new(dir.path().join("op-x-0"));
    let a = writer.append(b"hello");
    let b = writer.append(b"world!");
    let path = writer.finish(&fs, 0).unwrap();
    assert_eq!(fs.list_dir(dir.path()).unwrap(), vec![path]);
    assert_eq!(a.read_all(&fs).unwrap(), b"hello".to_vec());
    assert_eq!(b.read_all(&fs).unwrap(), b"world!".to_vec());
}

#[test]
fn read_errors_distinguish_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let fs = LocalFileSystem;
    let missing = dir.path().join("nope");
    assert!(fs.read_file(&missing).unwrap_err().is_not_found());
    std::fs::write(&missing, b"ab").unwrap();
    let err = fs.read_range(&missing, 1, 5).unwrap_err();
    assert!(matches!(err, Error::CorruptState(_)));
}
