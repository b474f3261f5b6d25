//! Crate-wide error type.
//!
//! Errors keep their cause. Use [`ResultExt::reraise`] to add a
//! message and the caller location on top of an existing error
//! without losing what went wrong underneath, so callers can still
//! tell a missing savepoint apart from a corrupt one via
//! [`Error::root_cause`].

use std::panic::Location;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::CheckpointId;
use crate::model::JobId;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a checkpoint or savepoint could not even be started.
///
/// None of these create a pending checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerFailure {
    #[error("no savepoint target directory given and no default configured")]
    NoSavepointDirectory,
    #[error("a checkpoint is already pending and concurrent checkpoints are disallowed")]
    TooManyConcurrentCheckpoints,
    #[error("job has no checkpointable tasks")]
    NoCheckpointableTasks,
    #[error("not all tasks of the job are running")]
    NotAllTasksRunning,
    #[error("checkpoint coordinator is shut down")]
    CoordinatorShutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{} not found", .path.display())]
    NotFound { path: PathBuf },
    #[error("corrupt state: {0}")]
    CorruptState(String),
    #[error("corrupt metadata at {}: {reason}", .path.display())]
    CorruptMetadata { path: PathBuf, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedded store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedded store migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("state {name:?} is already registered as {existing}, not {requested}")]
    StateKindMismatch {
        name: String,
        existing: String,
        requested: String,
    },
    #[error("no current key set on keyed state backend")]
    NoCurrentKey,
    #[error("unknown state {0:?}")]
    UnknownState(String),
    #[error("key group {key_group} is outside of this backend's range {range}")]
    KeyGroupOutOfRange { key_group: u32, range: String },
    #[error("checkpoint trigger failed: {0}")]
    Trigger(#[from] TriggerFailure),
    #[error("checkpoint {checkpoint_id} declined: {reason}")]
    Declined {
        checkpoint_id: CheckpointId,
        reason: String,
    },
    #[error("checkpoint {0} expired before all tasks acknowledged")]
    Expired(CheckpointId),
    #[error("checkpoint {checkpoint_id} aborted: {reason}")]
    Aborted {
        checkpoint_id: CheckpointId,
        reason: String,
    },
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {0} is not running")]
    JobNotRunning(JobId),
    #[error("job submission failed: {source}")]
    JobSubmission {
        #[source]
        source: Box<Error>,
    },
    #[error("operator failed: {0}")]
    Operator(String),
    #[error("no reply within {0:?}")]
    AskTimeout(Duration),
    #[error("job manager is gone")]
    Disconnected,
    #[error("checkpoint lock poisoned")]
    LockPoisoned,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("HTTP server error: {0}")]
    Http(String),
    #[error("({location}) {msg}")]
    Context {
        msg: String,
        location: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Walk through context and submission wrappers down to the error
    /// that actually happened.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Context { source, .. } | Error::JobSubmission { source } => source.root_cause(),
            err => err,
        }
    }

    /// Did this fail because some path does not exist?
    pub fn is_not_found(&self) -> bool {
        match self.root_cause() {
            Error::NotFound { .. } => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub(crate) fn serialization(msg: impl Into<String>) -> Self {
        Error::Serialization(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptState(msg.into())
    }
}

/// Add context to any error convertible into [`Error`].
pub trait ResultExt<T> {
    /// Wrap the error with a message and the caller's location.
    ///
    /// Example:
    ///     fs.read_file(&path).reraise("error reading savepoint metadata")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T>;

    /// Like [`ResultExt::reraise`] but only builds the message on
    /// error.
    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T> {
        let caller = Location::caller();
        self.map_err(|err| wrap(caller, msg.to_string(), err.into()))
    }

    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> Result<T> {
        let caller = Location::caller();
        self.map_err(|err| wrap(caller, msg(), err.into()))
    }
}

fn wrap(caller: &Location, msg: String, source: Error) -> Error {
    Error::Context {
        msg,
        location: caller.to_string(),
        source: Box::new(source),
    }
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn reraise_keeps_root_cause() {
    let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "missing",
    ));
    let err = res.reraise("error loading savepoint").unwrap_err();
    assert!(matches!(err, Error::Context { .. }));
    assert!(err.is_not_found());
    assert!(err.to_string().contains("error loading savepoint"));
    assert!(err.to_string().contains("errors.rs"));
}

#[test]
fn submission_error_exposes_cause() {
    let err = Error::JobSubmission {
        source: Box::new(Error::NotFound {
            path: PathBuf::from("unknown path"),
        }),
    };
    assert!(err.is_not_found());
    assert!(matches!(err.root_cause(), Error::NotFound { .. }));

    let err = Error::JobSubmission {
        source: Box::new(Error::corrupt("bad magic")),
    };
    assert!(!err.is_not_found());
    assert!(matches!(err.root_cause(), Error::CorruptState(_)));
}

#[test]
fn prepend_tname_prefixes_each_line() {
    let found = std::thread::Builder::new()
        .name("task-0".to_owned())
        .spawn(|| prepend_tname("a\nb".to_owned()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(found, "<task-0> a\n<task-0> b\n");
}
