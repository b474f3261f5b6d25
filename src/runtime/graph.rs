//! Jobs as submitted to the job manager.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use super::operator::*;
use crate::config::CheckpointingSettings;
use crate::config::RestartStrategy;
use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;
use crate::state::StateBackendKind;

pub type SourceFactory = Arc<dyn Fn(&SubtaskInfo) -> Box<dyn SourceFunction> + Send + Sync>;
pub type OperatorFactory = Arc<dyn Fn(&SubtaskInfo) -> Box<dyn StreamOperator> + Send + Sync>;

/// One parallel operator: a source and the chain after it.
#[derive(Clone)]
pub struct JobVertex {
    pub operator_id: OperatorId,
    pub name: String,
    pub parallelism: u32,
    pub max_parallelism: u32,
    pub(crate) source: SourceFactory,
    pub(crate) chain: Vec<(String, OperatorFactory)>,
    pub keyed_backend: Option<StateBackendKind>,
}

impl std::fmt::Debug for JobVertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobVertex")
            .field("operator_id", &self.operator_id)
            .field("name", &self.name)
            .field("parallelism", &self.parallelism)
            .field("max_parallelism", &self.max_parallelism)
            .field(
                "chain",
                &self.chain.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("keyed_backend", &self.keyed_backend)
            .finish()
    }
}

impl JobVertex {
    /// The operator ID is derived from the name, so resubmitting a
    /// vertex with the same name finds its old state.
    pub fn new<F>(name: impl Into<String>, parallelism: u32, source: F) -> Self
    where
        F: Fn(&SubtaskInfo) -> Box<dyn SourceFunction> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            operator_id: OperatorId::from_name(&name),
            name,
            parallelism,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            source: Arc::new(source),
            chain: Vec::new(),
            keyed_backend: None,
        }
    }

    /// Append an operator to the chain.
    pub fn with_operator<F>(mut self, name: impl Into<String>, operator: F) -> Self
    where
        F: Fn(&SubtaskInfo) -> Box<dyn StreamOperator> + Send + Sync + 'static,
    {
        self.chain.push((name.into(), Arc::new(operator)));
        self
    }

    pub fn with_operator_id(mut self, operator_id: OperatorId) -> Self {
        self.operator_id = operator_id;
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: u32) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_keyed_backend(mut self, kind: StateBackendKind) -> Self {
        self.keyed_backend = Some(kind);
        self
    }

    /// Source plus chained operators.
    pub fn chain_length(&self) -> usize {
        1 + self.chain.len()
    }

    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.chain.iter().map(|(name, _)| name.as_str())
    }
}

/// Restore a job from a savepoint or checkpoint on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavepointRestoreSettings {
    /// Savepoint directory or metadata file.
    pub path: PathBuf,
    /// Ignore state of operators no longer in the job instead of
    /// failing.
    pub allow_non_restored_state: bool,
}

impl SavepointRestoreSettings {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            allow_non_restored_state: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobGraph {
    pub job_id: JobId,
    pub name: String,
    pub vertices: Vec<JobVertex>,
    /// Falls back to the cluster's settings.
    pub checkpointing: Option<CheckpointingSettings>,
    /// Falls back to the cluster's strategy.
    pub restart_strategy: Option<RestartStrategy>,
    pub restore_settings: Option<SavepointRestoreSettings>,
}

impl JobGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            job_id: JobId::random(),
            name: name.into(),
            vertices: Vec::new(),
            checkpointing: None,
            restart_strategy: None,
            restore_settings: None,
        }
    }

    pub fn with_vertex(mut self, vertex: JobVertex) -> Self {
        self.vertices.push(vertex);
        self
    }

    pub fn with_checkpointing(mut self, settings: CheckpointingSettings) -> Self {
        self.checkpointing = Some(settings);
        self
    }

    pub fn with_restart_strategy(mut self, strategy: RestartStrategy) -> Self {
        self.restart_strategy = Some(strategy);
        self
    }

    pub fn with_restore_settings(mut self, settings: SavepointRestoreSettings) -> Self {
        self.restore_settings = Some(settings);
        self
    }

    pub fn set_restore_settings(&mut self, settings: Option<SavepointRestoreSettings>) {
        self.restore_settings = settings;
    }

    pub fn vertex(&self, operator_id: OperatorId) -> Option<&JobVertex> {
        self.vertices.iter().find(|v| v.operator_id == operator_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() {
            return Err(Error::Config(format!("job {:?} has no vertices", self.name)));
        }
        let mut seen = HashSet::new();
        for vertex in &self.vertices {
            if !seen.insert(vertex.operator_id) {
                return Err(Error::Config(format!(
                    "duplicate operator ID {} for vertex {:?}",
                    vertex.operator_id, vertex.name
                )));
            }
            if vertex.parallelism == 0 || vertex.parallelism > vertex.max_parallelism {
                return Err(Error::Config(format!(
                    "vertex {:?} parallelism {} must be in 1..={}",
                    vertex.name, vertex.parallelism, vertex.max_parallelism
                )));
            }
        }
        if let Some(settings) = &self.checkpointing {
            settings.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    /// Waiting out the restart delay after a failure.
    Restarting,
    Finished,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
struct NoopSource;

#[cfg(test)]
impl SourceFunction for NoopSource {
    fn poll_next(&mut self, _info: &SubtaskInfo) -> Result<SourcePoll> {
        Ok(SourcePoll::Finished)
    }
}

#[test]
fn validate_catches_bad_graphs() {
    assert!(JobGraph::new("empty").validate().is_err());

    let vertex = JobVertex::new("src", 2, |_| Box::new(NoopSource) as Box<dyn SourceFunction>);
    let graph = JobGraph::new("dup")
        .with_vertex(vertex.clone())
        .with_vertex(vertex.clone());
    assert!(graph.validate().is_err());

    let graph = JobGraph::new("too wide").with_vertex(vertex.clone().with_max_parallelism(1));
    assert!(graph.validate().is_err());

    let graph = JobGraph::new("ok").with_vertex(vertex);
    graph.validate().unwrap();
}
