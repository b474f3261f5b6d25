//! Cluster configuration.
//!
//! Load from a JSON file with [`ClusterConfig::load`] or start from
//! defaults with [`ClusterConfig::from_env`]; in both cases `SNAPFLOW_*`
//! environment variables override what was loaded.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;
use crate::errors::ResultExt;

/// Serialize [`Duration`]s as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub(crate) mod opt_duration_ms {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

/// How a job takes checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingSettings {
    /// Take a periodic checkpoint this often. [`None`] disables
    /// periodic checkpoints; savepoints still work.
    #[serde(with = "opt_duration_ms")]
    pub interval: Option<Duration>,
    /// Expire checkpoints not fully acknowledged within this long.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Pending periodic checkpoints allowed at once. Savepoints don't
    /// count against this.
    pub max_concurrent: usize,
    /// Completed periodic checkpoints kept around.
    pub retained: usize,
    /// Consecutive declined or expired checkpoints tolerated before
    /// failing the job.
    pub tolerable_failures: u32,
}

impl Default for CheckpointingSettings {
    fn default() -> Self {
        Self {
            interval: None,
            timeout: Duration::from_secs(600),
            max_concurrent: 1,
            retained: 1,
            tolerable_failures: 3,
        }
    }
}

/// What to do when a task fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Fail the job.
    #[default]
    None,
    /// Redeploy from the latest completed checkpoint up to `attempts`
    /// times, waiting `delay` before each.
    FixedDelay {
        attempts: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Periodic checkpoints go in `<checkpoint_dir>/<job_id>/chk-<id>`.
    pub checkpoint_dir: PathBuf,
    /// Where savepoints go when a trigger names no directory.
    pub savepoint_dir: Option<PathBuf>,
    /// Where embedded store instances keep their files.
    pub state_dir: PathBuf,
    /// Periodic checkpoint state smaller than this stays inline in the
    /// metadata. Savepoints always write files.
    pub file_state_threshold: usize,
    /// Extra attempts at writing a state file before declining.
    pub write_retries: u32,
    /// Default timeout of requests to the job manager.
    #[serde(with = "duration_ms")]
    pub ask_timeout: Duration,
    /// Serve the HTTP API on this port.
    pub api_port: Option<u16>,
    pub log_level: Option<String>,
    /// Used by jobs that don't set their own.
    pub checkpointing: CheckpointingSettings,
    /// Used by jobs that don't set their own.
    pub restart_strategy: RestartStrategy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("snapflow");
        Self {
            checkpoint_dir: base.join("checkpoints"),
            savepoint_dir: None,
            state_dir: base.join("state"),
            file_state_threshold: 1024,
            write_retries: 2,
            ask_timeout: Duration::from_secs(60),
            api_port: None,
            log_level: None,
            checkpointing: CheckpointingSettings::default(),
            restart_strategy: RestartStrategy::None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| Error::Config(format!("invalid {name}={value:?}: {err}")))
}

impl ClusterConfig {
    /// Read a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).reraise_with(|| format!("error reading config {path:?}"))?;
        let mut config: Self = serde_json::from_slice(&bytes)
            .reraise_with(|| format!("error parsing config {path:?}"))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_var("SNAPFLOW_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_var("SNAPFLOW_SAVEPOINT_DIR") {
            self.savepoint_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = env_var("SNAPFLOW_CHECKPOINT_INTERVAL_MS") {
            let ms: u64 = parse_env("SNAPFLOW_CHECKPOINT_INTERVAL_MS", &ms)?;
            self.checkpointing.interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = env_var("SNAPFLOW_CHECKPOINT_TIMEOUT_MS") {
            self.checkpointing.timeout =
                Duration::from_millis(parse_env("SNAPFLOW_CHECKPOINT_TIMEOUT_MS", &ms)?);
        }
        if let Some(port) = env_var("SNAPFLOW_API_PORT") {
            self.api_port = Some(parse_env("SNAPFLOW_API_PORT", &port)?);
        }
        if let Some(level) = env_var("SNAPFLOW_LOG") {
            self.log_level = Some(level);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.checkpointing.validate()
    }
}

impl CheckpointingSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config(
                "max concurrent checkpoints must be at least 1".to_owned(),
            ));
        }
        if self.retained == 0 {
            return Err(Error::Config(
                "must retain at least 1 completed checkpoint".to_owned(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("checkpoint timeout must be positive".to_owned()));
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::Config(
                "checkpoint interval must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[test]
fn json_uses_millis_and_defaults() {
    let config: ClusterConfig = serde_json::from_str(
        r#"{
            "checkpoint_dir": "/tmp/chk",
            "checkpointing": {"interval": 500, "retained": 2},
            "restart_strategy": {"type": "fixed_delay", "attempts": 3, "delay": 10}
        }"#,
    )
    .unwrap();
    assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/chk"));
    assert_eq!(
        config.checkpointing.interval,
        Some(Duration::from_millis(500))
    );
    assert_eq!(config.checkpointing.retained, 2);
    assert_eq!(config.checkpointing.max_concurrent, 1);
    assert_eq!(
        config.restart_strategy,
        RestartStrategy::FixedDelay {
            attempts: 3,
            delay: Duration::from_millis(10)
        }
    );
    config.validate().unwrap();
}

#[test]
fn invalid_settings_are_rejected() {
    let settings = CheckpointingSettings {
        max_concurrent: 0,
        ..Default::default()
    };
    assert!(matches!(settings.validate(), Err(Error::Config(_))));
    let settings = CheckpointingSettings {
        interval: Some(Duration::ZERO),
        ..Default::default()
    };
    assert!(settings.validate().is_err());
}

#[test]
fn load_applies_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"write_retries": 5}"#).unwrap();
    let config = ClusterConfig::load(&path).unwrap();
    assert_eq!(config.write_retries, 5);
    assert!(ClusterConfig::load(&dir.path().join("missing.json"))
        .unwrap_err()
        .is_not_found());
}
