use std::collections::HashMap;
use std::path::Path;

use snapflow::config::ClusterConfig;
use snapflow::model::*;
use snapflow::run::LocalCluster;
use snapflow::runtime::*;
use snapflow::state::*;
use snapflow::testing::*;

const KEYS: u64 = 40;
const MAX_PARALLELISM: u32 = 16;

fn config(dir: &Path) -> ClusterConfig {
    ClusterConfig {
        checkpoint_dir: dir.join("checkpoints"),
        state_dir: dir.join("state"),
        ..Default::default()
    }
}

/// Emits `(k, k)` for every owned key `k < KEYS`, `rounds` times over,
/// then idles. Keeps no state of its own.
struct KeyRounds {
    rounds: u64,
    round: u64,
    next: u64,
    latch: CountDownLatch,
}

impl KeyRounds {
    fn new(rounds: u64, latch: CountDownLatch) -> Self {
        Self {
            rounds,
            round: 0,
            next: 0,
            latch,
        }
    }
}

impl SourceFunction for KeyRounds {
    fn poll_next(&mut self, info: &SubtaskInfo) -> snapflow::Result<SourcePoll> {
        while self.round < self.rounds {
            if self.next == KEYS {
                self.next = 0;
                self.round += 1;
                if self.round == self.rounds {
                    self.latch.count_down();
                }
                continue;
            }
            let key = self.next.to_be_bytes();
            self.next += 1;
            if info.owns_key(&key) {
                return Ok(SourcePoll::Ready(Record::new(key.to_vec(), key.to_vec())));
            }
        }
        Ok(SourcePoll::Idle)
    }
}

/// Adds record values per key and emits the running sum.
struct KeyedSum {
    sum: ValueStateDescriptor<i64>,
    namespace: Namespace,
}

impl Default for KeyedSum {
    fn default() -> Self {
        Self {
            sum: ValueStateDescriptor::new("sum", I64Serializer).with_default(0),
            namespace: Namespace::void(),
        }
    }
}

impl StreamOperator for KeyedSum {
    fn process(&mut self, record: Record, ctx: &mut OperatorContext<'_>) -> snapflow::Result<()> {
        let value = decode(&record.value) as i64;
        let mut sum = ctx
            .keyed_state()?
            .get_or_create_value_state(&self.namespace, &self.sum)?;
        let total = sum.value()?.unwrap_or(0) + value;
        sum.update(&total)?;
        ctx.emit(Record::new(record.key, total.to_be_bytes().to_vec()));
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn sum_vertex(
    parallelism: u32,
    rounds: u64,
    latch: &CountDownLatch,
    backend: &StateBackendKind,
    sink: &CollectSink,
) -> JobVertex {
    let latch = latch.clone();
    let sink = sink.clone();
    JobVertex::new("keyed-sum", parallelism, move |_| {
        Box::new(KeyRounds::new(rounds, latch.clone())) as Box<dyn SourceFunction>
    })
    .with_max_parallelism(MAX_PARALLELISM)
    .with_keyed_backend(backend.clone())
    .with_operator("sum", |_| Box::new(KeyedSum::default()) as Box<dyn StreamOperator>)
    .with_operator("sink", move |_| Box::new(sink.clone()) as Box<dyn StreamOperator>)
}

/// Last emitted sum of every key.
fn latest_sums(sink: &CollectSink) -> HashMap<u64, u64> {
    sink.records()
        .into_iter()
        .map(|r| (decode(&r.key), decode(&r.value)))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keyed_state_restores_at_same_and_new_parallelism() {
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

        let latch = CountDownLatch::new(2);
        let sink = CollectSink::default();
        let graph = JobGraph::new(format!("keyed-{name}"))
            .with_vertex(sum_vertex(2, 3, &latch, &backend, &sink));
        let job_id = gateway.submit_job(graph.clone()).await.unwrap();
        latch.wait().await;

        // The sources are idle, so the state is what the sink saw last.
        let at_trigger = latest_sums(&sink);
        assert_eq!(at_trigger.len(), KEYS as usize);
        assert!(at_trigger.iter().all(|(k, sum)| *sum == 3 * k));

        let savepoint = gateway
            .trigger_savepoint(job_id, Some(dir.join("savepoints")))
            .await
            .unwrap();
        let metadata = gateway.request_savepoint(savepoint.clone()).await.unwrap();
        assert_eq!(metadata.task_states.len(), 1);
        assert!(metadata.task_states[0]
            .states()
            .all(|(_, s)| matches!(
                s.managed_keyed_state.as_ref().map(|k| &k.delegate),
                Some(StreamStateHandle::File { .. })
            )));
        gateway.cancel_job(job_id).await.unwrap();

        for parallelism in [2, 3, 1] {
            let latch = CountDownLatch::new(parallelism as usize);
            let sink = CollectSink::default();
            let mut restored = graph.clone();
            restored.vertices = vec![sum_vertex(parallelism, 1, &latch, &backend, &sink)];
            restored.set_restore_settings(Some(SavepointRestoreSettings::for_path(&savepoint)));
            gateway.submit_job(restored).await.unwrap();
            latch.wait().await;

            // One more round on top of the restored sums.
            let sums = latest_sums(&sink);
            assert_eq!(sums.len(), KEYS as usize, "{name} at {parallelism}");
            for (key, sum) in &sums {
                assert_eq!(*sum, at_trigger[key] + key, "{name} at {parallelism}");
            }
            gateway.cancel_job(job_id).await.unwrap();
        }

        // Offsets that don't cover their key group range fail the
        // submission and leave the job manager up.
        let metadata_path = savepoint.join("_metadata");
        let original = std::fs::read(&metadata_path).unwrap();
        let mut json: serde_json::Value = serde_json::from_slice(&original).unwrap();
        json["task_states"][0]["subtask_states"][0]["managed_keyed_state"]["offsets"]["offsets"] =
            serde_json::json!([9]);
        std::fs::write(&metadata_path, serde_json::to_vec(&json).unwrap()).unwrap();
        let mut corrupt = graph.clone();
        corrupt.set_restore_settings(Some(SavepointRestoreSettings::for_path(&savepoint)));
        let err = gateway.submit_job(corrupt).await.unwrap_err();
        assert!(matches!(err, snapflow::Error::JobSubmission { .. }), "{err}");
        assert!(
            matches!(err.root_cause(), snapflow::Error::CorruptMetadata { .. }),
            "{err}"
        );
        assert_eq!(gateway.job_status(job_id).await.unwrap(), JobStatus::Canceled);
        std::fs::write(&metadata_path, original).unwrap();

        gateway.dispose_savepoint(savepoint).await.unwrap();
        cluster.shutdown().await.unwrap();
    }
}
