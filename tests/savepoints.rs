use std::path::Path;
use std::sync::Arc;

use snapflow::config::ClusterConfig;
use snapflow::model::*;
use snapflow::run::LocalCluster;
use snapflow::runtime::*;
use snapflow::state::StateBackendKind;
use snapflow::storage::FileSystem;
use snapflow::storage::LocalFileSystem;
use snapflow::testing::*;

const PARALLELISM: u32 = 4;

fn config(dir: &Path) -> ClusterConfig {
    ClusterConfig {
        checkpoint_dir: dir.join("checkpoints"),
        state_dir: dir.join("state"),
        ..Default::default()
    }
}

fn counter_vertex(latch: &CountDownLatch) -> JobVertex {
    let latch = latch.clone();
    JobVertex::new("stateful-counter", PARALLELISM, move |_| {
        Box::new(StatefulCounter::new(latch.clone())) as Box<dyn SourceFunction>
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trigger_restore_and_dispose_savepoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let cluster = LocalCluster::start(config.clone()).await.unwrap();
    let gateway = cluster.gateway();

    let latch = CountDownLatch::new(PARALLELISM as usize);
    let graph = JobGraph::new("savepoint-cycle").with_vertex(counter_vertex(&latch));
    let job_id = gateway.submit_job(graph.clone()).await.unwrap();
    latch.wait().await;

    let savepoint_dir = dir.path().join("savepoints");
    let savepoint = gateway
        .trigger_savepoint(job_id, Some(savepoint_dir.clone()))
        .await
        .unwrap();
    assert!(savepoint.starts_with(&savepoint_dir));
    // Metadata plus one state file per subtask.
    assert_eq!(files_below(&savepoint).len(), 1 + PARALLELISM as usize);

    let metadata = gateway.request_savepoint(savepoint.clone()).await.unwrap();
    assert_eq!(metadata.kind, CheckpointKind::Savepoint);
    assert_eq!(metadata.job_id, job_id);
    assert_eq!(metadata.task_states.len(), 1);
    let task_state = &metadata.task_states[0];
    assert_eq!(task_state.parallelism, PARALLELISM);
    assert_eq!(task_state.number_collected_states(), PARALLELISM as usize);

    gateway.cancel_job(job_id).await.unwrap();
    assert_eq!(gateway.job_status(job_id).await.unwrap(), JobStatus::Canceled);
    assert!(!config.checkpoint_dir.join(job_id.to_string()).exists());

    // Resubmit from the savepoint.
    let mut deployments = gateway.register_deployment_listener(job_id).await.unwrap();
    let restored_latch = CountDownLatch::new(PARALLELISM as usize);
    let mut resubmitted = graph.clone();
    resubmitted.vertices = vec![counter_vertex(&restored_latch)];
    resubmitted.set_restore_settings(Some(SavepointRestoreSettings::for_path(&savepoint)));
    assert_eq!(gateway.submit_job(resubmitted).await.unwrap(), job_id);

    for _ in 0..PARALLELISM {
        let tdd = deployments.recv().await.unwrap();
        let restored = tdd.restore_state.expect("every subtask restores state");
        let legacy = restored.legacy_operator_state.unwrap();
        let expected = task_state.state(tdd.subtask_index).unwrap();
        assert_eq!(legacy, expected.legacy_operator_state);

        let bytes = legacy.get(0).unwrap().read_all(&LocalFileSystem).unwrap();
        let (count, _) = StatefulCounter::decode_state(&bytes).unwrap();
        assert!(count > 0);
    }
    restored_latch.wait().await;
    assert_eq!(gateway.job_status(job_id).await.unwrap(), JobStatus::Running);

    gateway.cancel_job(job_id).await.unwrap();
    gateway.dispose_savepoint(savepoint.clone()).await.unwrap();
    assert!(!savepoint.exists());
    assert!(files_below(&savepoint_dir).is_empty());

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submitting_from_unknown_path_fails_before_deploying() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = LocalCluster::start(config(dir.path())).await.unwrap();
    let gateway = cluster.gateway();

    let latch = CountDownLatch::new(PARALLELISM as usize);
    let graph = JobGraph::new("unknown-path")
        .with_vertex(counter_vertex(&latch))
        .with_restore_settings(SavepointRestoreSettings::for_path("unknown path"));
    let mut deployments = gateway
        .register_deployment_listener(graph.job_id)
        .await
        .unwrap();

    let err = gateway.submit_job(graph.clone()).await.unwrap_err();
    assert!(matches!(err, snapflow::Error::JobSubmission { .. }));
    assert!(err.is_not_found(), "{err}");
    assert!(deployments.try_recv().is_err());
    assert!(matches!(
        gateway.job_status(graph.job_id).await,
        Err(snapflow::Error::JobNotFound(_))
    ));

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_storage_declines_savepoint_and_job_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(FlakyFileSystem::default());
    let cluster = LocalCluster::start_with_fs(config(dir.path()), fs.clone())
        .await
        .unwrap();
    let gateway = cluster.gateway();

    let latch = CountDownLatch::new(PARALLELISM as usize);
    let job_id = gateway
        .submit_job(JobGraph::new("flaky").with_vertex(counter_vertex(&latch)))
        .await
        .unwrap();
    latch.wait().await;

    let savepoint_dir = dir.path().join("savepoints");
    fs.fail_writes(true);
    let err = gateway
        .trigger_savepoint(job_id, Some(savepoint_dir.clone()))
        .await
        .unwrap_err();
    assert!(
        matches!(err.root_cause(), snapflow::Error::Declined { .. }),
        "{err}"
    );
    assert!(fs.failed_writes() > 0);
    assert!(files_below(&savepoint_dir).is_empty());
    assert_eq!(gateway.job_status(job_id).await.unwrap(), JobStatus::Running);

    fs.fail_writes(false);
    let savepoint = gateway
        .trigger_savepoint(job_id, Some(savepoint_dir))
        .await
        .unwrap();
    assert_eq!(files_below(&savepoint).len(), 1 + PARALLELISM as usize);

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_filter_on_both_backends() {
    let scratch = tempfile::tempdir().unwrap();
    for (name, backend) in [
        ("heap", StateBackendKind::Heap),
        (
            "sqlite",
            StateBackendKind::Sqlite {
                base_dir: scratch.path().join("sqlite"),
            },
        ),
    ] {
        let dir = scratch.path().join(name);
        let cluster = LocalCluster::start(config(&dir)).await.unwrap();
        let gateway = cluster.gateway();

        // Every integer shows up twice; the filter passes one of each.
        let sink = CollectSink::default();
        let vertex = {
            let sink = sink.clone();
            JobVertex::new("dedup", 2, |_| {
                Box::new(IntegerStreamSource::new(20).with_repeats(2)) as Box<dyn SourceFunction>
            })
            .with_max_parallelism(16)
            .with_keyed_backend(backend)
            .with_operator("filter", |_| {
                Box::new(DuplicateFilter::default()) as Box<dyn StreamOperator>
            })
            .with_operator("sink", move |_| {
                Box::new(sink.clone()) as Box<dyn StreamOperator>
            })
        };

        let graph = JobGraph::new(format!("dedup-{name}")).with_vertex(vertex);
        let job_id = gateway.submit_job(graph).await.unwrap();
        let status = gateway
            .wait_for_status(job_id, |s| s.is_terminal())
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Finished);
        assert_eq!(sink.records().len(), 20);
        assert_eq!(sink.distinct_keys().len(), 20);

        cluster.shutdown().await.unwrap();
    }
}

/// Fails once after `fail` is triggered.
struct FailOnce {
    counter: StatefulCounter,
    fail: OneShotLatch,
    failed: Arc<std::sync::atomic::AtomicBool>,
}

impl SourceFunction for FailOnce {
    fn poll_next(&mut self, info: &SubtaskInfo) -> snapflow::Result<SourcePoll> {
        if self.fail.is_triggered() && !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(snapflow::Error::Operator("injected failure".to_owned()));
        }
        self.counter.poll_next(info)
    }

    fn snapshot_state(&mut self, checkpoint_id: CheckpointId) -> snapflow::Result<Option<Vec<u8>>> {
        self.counter.snapshot_state(checkpoint_id)
    }

    fn restore_state(&mut self, info: &SubtaskInfo, state: Vec<u8>) -> snapflow::Result<()> {
        self.counter.restore_state(info, state)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_job_restarts_from_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = LocalCluster::start(config(dir.path())).await.unwrap();
    let gateway = cluster.gateway();

    let latch = CountDownLatch::new(1);
    let fail = OneShotLatch::default();
    let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let vertex = {
        let latch = latch.clone();
        let fail = fail.clone();
        JobVertex::new("fail-once", 1, move |_| {
            Box::new(FailOnce {
                counter: StatefulCounter::new(latch.clone()),
                fail: fail.clone(),
                failed: failed.clone(),
            }) as Box<dyn SourceFunction>
        })
    };
    let graph = JobGraph::new("restart")
        .with_vertex(vertex)
        .with_restart_strategy(snapflow::config::RestartStrategy::FixedDelay {
            attempts: 1,
            delay: std::time::Duration::from_millis(10),
        });
    let mut deployments = gateway
        .register_deployment_listener(graph.job_id)
        .await
        .unwrap();
    let job_id = gateway.submit_job(graph).await.unwrap();
    assert!(deployments.recv().await.unwrap().restore_state.is_none());
    latch.wait().await;

    let checkpoint = gateway.trigger_checkpoint(job_id).await.unwrap();
    let metadata = gateway.request_savepoint(checkpoint).await.unwrap();
    assert_eq!(metadata.kind, CheckpointKind::Checkpoint);
    fail.trigger();

    let tdd = deployments.recv().await.unwrap();
    assert_eq!(tdd.attempt, 1);
    let restored = tdd.restore_state.unwrap().legacy_operator_state.unwrap();
    assert_eq!(
        &restored,
        &metadata.task_states[0]
            .state(SubtaskIndex(0))
            .unwrap()
            .legacy_operator_state
    );
    gateway
        .wait_for_status(job_id, |s| s == JobStatus::Running)
        .await
        .unwrap();

    cluster.shutdown().await.unwrap();
    assert!(LocalFileSystem
        .list_dir(&dir.path().join("checkpoints"))
        .unwrap()
        .is_empty());
}
