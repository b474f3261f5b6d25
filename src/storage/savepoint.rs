//! Reading, writing and disposing checkpoint metadata.

use std::path::Path;
use std::path::PathBuf;

use tracing::instrument;

use super::CheckpointStorageLocation;
use super::FileSystem;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::ResultExt;
use crate::model::*;

pub const METADATA_FILE_NAME: &str = "_metadata";

/// Write the metadata file into a checkpoint or savepoint directory.
///
/// Returns the path of the written file.
#[instrument(skip_all, fields(checkpoint_id = %metadata.checkpoint_id))]
pub fn store_metadata(
    fs: &dyn FileSystem,
    location: &CheckpointStorageLocation,
    metadata: &CheckpointMetadata,
) -> Result<PathBuf> {
    let path = location.metadata_path();
    let json = serde_json::to_vec_pretty(metadata)?;
    fs.write_file(&path, &json)
        .reraise("error writing checkpoint metadata")?;
    Ok(path)
}

/// Find the metadata file given either it or its directory.
pub fn resolve_metadata_path(fs: &dyn FileSystem, path: &Path) -> Result<PathBuf> {
    if fs.is_dir(path) {
        let metadata_path = path.join(METADATA_FILE_NAME);
        if fs.exists(&metadata_path) {
            Ok(metadata_path)
        } else {
            Err(Error::NotFound {
                path: metadata_path,
            })
        }
    } else if fs.exists(path) {
        Ok(path.to_owned())
    } else {
        Err(Error::NotFound {
            path: path.to_owned(),
        })
    }
}

/// Load checkpoint metadata from a path previously returned by a
/// savepoint trigger.
///
/// Errors with [`Error::NotFound`] if nothing is there and
/// [`Error::CorruptMetadata`] if it can't be parsed.
#[instrument(skip(fs))]
pub fn load_metadata(fs: &dyn FileSystem, path: &Path) -> Result<CheckpointMetadata> {
    let metadata_path = resolve_metadata_path(fs, path)?;
    let bytes = fs.read_file(&metadata_path)?;
    let metadata: CheckpointMetadata =
        serde_json::from_slice(&bytes).map_err(|err| Error::CorruptMetadata {
            path: metadata_path.clone(),
            reason: err.to_string(),
        })?;
    if metadata.version != METADATA_VERSION {
        return Err(Error::CorruptMetadata {
            path: metadata_path,
            reason: format!(
                "unsupported metadata version {}, expected {METADATA_VERSION}",
                metadata.version
            ),
        });
    }
    Ok(metadata)
}

/// Remove the files of a savepoint and then its directory.
///
/// Individual state files that can't be removed are logged and
/// skipped; the directory removal at the end sweeps up whatever was
/// left behind.
#[instrument(skip(fs))]
pub fn dispose_savepoint(fs: &dyn FileSystem, path: &Path) -> Result<()> {
    let metadata_path = resolve_metadata_path(fs, path)?;
    let metadata = load_metadata(fs, &metadata_path)?;
    if let Err(err) = metadata.discard_state(fs) {
        tracing::warn!("Error discarding state of savepoint {path:?}: {err}");
    }
    fs.delete_file(&metadata_path)?;
    if let Some(dir) = metadata_path.parent() {
        fs.delete_dir(dir, true)
            .reraise_with(|| format!("error removing savepoint directory {dir:?}"))?;
    }
    tracing::info!("Disposed savepoint at {path:?}");
    Ok(())
}

#[cfg(test)]
fn stored_savepoint(
    fs: &dyn FileSystem,
    root: &Path,
) -> (CheckpointStorageLocation, CheckpointMetadata) {
    let location = CheckpointStorageLocation {
        kind: CheckpointKind::Savepoint,
        dir: root.join("savepoint-1"),
    };
    fs.create_dir_all(&location.dir).unwrap();
    let op = OperatorId(9);
    let mut writer = super::StateFileWriter::new(location.state_file_path(op, SubtaskIndex(0)));
    let handle = writer.append(b"state");
    writer.finish(fs, 0).unwrap();
    let mut task_state = TaskState::new(op, 1, 128, 1);
    task_state
        .put_state(
            SubtaskIndex(0),
            SubtaskState {
                legacy_operator_state: ChainedStateHandle::wrap_single(handle),
                managed_keyed_state: None,
            },
        )
        .unwrap();
    let metadata = CheckpointMetadata {
        version: METADATA_VERSION,
        job_id: JobId(1),
        checkpoint_id: CheckpointId(1),
        timestamp: chrono::Utc::now(),
        kind: CheckpointKind::Savepoint,
        task_states: vec![task_state],
    };
    store_metadata(fs, &location, &metadata).unwrap();
    (location, metadata)
}

#[test]
fn load_by_dir_or_file() {
    let dir = tempfile::tempdir().unwrap();
    let fs = super::LocalFileSystem;
    let (location, metadata) = stored_savepoint(&fs, dir.path());
    assert_eq!(load_metadata(&fs, &location.dir).unwrap(), metadata);
    assert_eq!(
        load_metadata(&fs, &location.metadata_path()).unwrap(),
        metadata
    );
}

#[test]
fn load_missing_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let fs = super::LocalFileSystem;
    let err = load_metadata(&fs, Path::new("unknown path")).unwrap_err();
    assert!(err.is_not_found());
    let err = load_metadata(&fs, dir.path()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn load_garbage_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let fs = super::LocalFileSystem;
    std::fs::write(dir.path().join(METADATA_FILE_NAME), b"not json").unwrap();
    let err = load_metadata(&fs, dir.path()).unwrap_err();
    assert!(matches!(err, Error::CorruptMetadata { .. }));
}

#[test]
fn dispose_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let fs = super::LocalFileSystem;
    let (location, _) = stored_savepoint(&fs, dir.path());
    assert_eq!(fs.list_dir(&location.dir).unwrap().len(), 2);
    dispose_savepoint(&fs, &location.dir).unwrap();
    assert!(fs.list_dir(dir.path()).unwrap().is_empty());
    assert!(dispose_savepoint(&fs, &location.dir)
        .unwrap_err()
        .is_not_found());
}
