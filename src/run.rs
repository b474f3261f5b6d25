//! Starting all the pieces of a cluster in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::ClusterConfig;
use crate::errors::Error;
use crate::errors::Result;
use crate::metrics::initialize_metrics;
use crate::metrics::MetricStore;
use crate::metrics::SharedMetricStore;
use crate::runtime::JobManager;
use crate::runtime::JobManagerGateway;
use crate::storage::FileSystem;
use crate::storage::LocalFileSystem;
use crate::tracing::setup_tracing;
use crate::webserver::ApiServer;

/// A job manager, its tasks and optionally the HTTP API, all running
/// on the current tokio runtime.
///
/// Tasks run on their own threads, so use a multi threaded runtime.
pub struct LocalCluster {
    config: Arc<ClusterConfig>,
    fs: Arc<dyn FileSystem>,
    metrics: SharedMetricStore,
    gateway: JobManagerGateway,
    job_manager: JoinHandle<()>,
    api: Option<ApiServer>,
}

impl LocalCluster {
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        Self::start_with_fs(config, Arc::new(LocalFileSystem)).await
    }

    /// Start with checkpoints and savepoints going through `fs`.
    #[instrument(skip_all)]
    pub async fn start_with_fs(config: ClusterConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        config.validate()?;
        setup_tracing(config.log_level.as_deref())?;
        initialize_metrics()?;

        let config = Arc::new(config);
        let metrics = MetricStore::shared();
        let api = match config.api_port {
            Some(port) => {
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                Some(ApiServer::start(addr, metrics.clone()).await?)
            }
            None => None,
        };
        let (gateway, job_manager) = JobManager::spawn(config.clone(), fs.clone(), metrics.clone());
        tracing::info!(
            "Local cluster started; checkpoints in {:?}",
            config.checkpoint_dir
        );
        Ok(Self {
            config,
            fs,
            metrics,
            gateway,
            job_manager,
            api,
        })
    }

    pub fn gateway(&self) -> &JobManagerGateway {
        &self.gateway
    }

    pub fn metrics(&self) -> &SharedMetricStore {
        &self.metrics
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Where the HTTP API listens, if it was enabled.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api.as_ref().map(ApiServer::local_addr)
    }

    /// Cancel all jobs, then stop the job manager and the HTTP API.
    pub async fn shutdown(self) -> Result<()> {
        let res = self.gateway.shutdown().await;
        if let Err(err) = self.job_manager.await {
            tracing::error!("Job manager task died: {err}");
        }
        if let Some(api) = self.api {
            api.stop().await?;
        }
        tracing::info!("Local cluster stopped");
        res
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("config", &self.config)
            .field("api_addr", &self.api_addr())
            .finish()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starts_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        checkpoint_dir: dir.path().join("checkpoints"),
        state_dir: dir.path().join("state"),
        api_port: Some(0),
        ..Default::default()
    };
    let cluster = LocalCluster::start(config).await.unwrap();
    assert!(cluster.api_addr().is_some());
    let job_id = crate::model::JobId(5);
    assert!(matches!(
        cluster.gateway().job_status(job_id).await,
        Err(Error::JobNotFound(id)) if id == job_id
    ));
    cluster.shutdown().await.unwrap();
}
