//! Metrics.
//!
//! Counters and histograms go through the global OpenTelemetry meter
//! provider and end up in the default Prometheus registry, which the
//! webserver exposes. Task level numbers are also kept in a
//! [`MetricStore`] so they can be looked up per job vertex.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::RwLock;

use opentelemetry::global;
use opentelemetry_sdk::metrics::new_view;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;

use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

static INITIALIZED: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Install a global meter provider exporting to the default
/// Prometheus registry. Only the first call does anything.
pub fn initialize_metrics() -> Result<()> {
    INITIALIZED
        .get_or_init(|| install_provider().map_err(|err| err.to_string()))
        .clone()
        .map_err(Error::Config)
}

fn install_provider() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(default_registry().clone())
        .with_namespace("snapflow")
        .build()?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(new_view(
            // Must match histogram names.
            Instrument::new().name("*duration*"),
            Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                boundaries: vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0, 30.0, 60.0,
                ],
                record_min_max: true,
            }),
        )?)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Latest metric values reported by tasks, per job vertex.
///
/// Task metrics are keyed `<subtask>.<name>`, operator metrics
/// `<subtask>.<operator>.<name>`.
#[derive(Debug, Default)]
pub struct MetricStore {
    jobs: HashMap<JobId, HashMap<OperatorId, HashMap<String, String>>>,
}

pub type SharedMetricStore = Arc<RwLock<MetricStore>>;

impl MetricStore {
    pub fn shared() -> SharedMetricStore {
        Arc::new(RwLock::new(Self::default()))
    }

    fn vertex_mut(&mut self, job_id: JobId, vertex_id: OperatorId) -> &mut HashMap<String, String> {
        self.jobs
            .entry(job_id)
            .or_default()
            .entry(vertex_id)
            .or_default()
    }

    pub fn add_task_metric(
        &mut self,
        job_id: JobId,
        vertex_id: OperatorId,
        subtask_index: SubtaskIndex,
        name: &str,
        value: impl ToString,
    ) {
        self.vertex_mut(job_id, vertex_id)
            .insert(format!("{subtask_index}.{name}"), value.to_string());
    }

    pub fn add_operator_metric(
        &mut self,
        job_id: JobId,
        vertex_id: OperatorId,
        subtask_index: SubtaskIndex,
        operator: &str,
        name: &str,
        value: impl ToString,
    ) {
        self.vertex_mut(job_id, vertex_id).insert(
            format!("{subtask_index}.{operator}.{name}"),
            value.to_string(),
        );
    }

    pub fn vertex_metrics(
        &self,
        job_id: JobId,
        vertex_id: OperatorId,
    ) -> Option<&HashMap<String, String>> {
        self.jobs.get(&job_id)?.get(&vertex_id)
    }

    pub fn remove_job(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }
}

/// Answers `/jobs/:jobid/vertices/:vertexid/metrics`.
pub struct JobVertexMetricsHandler;

impl JobVertexMetricsHandler {
    pub const JOB_ID_PARAM: &'static str = "jobid";
    pub const VERTEX_ID_PARAM: &'static str = "vertexid";

    /// The metrics of the vertex named by the path parameters.
    ///
    /// [`None`] if a parameter is missing or malformed, or nothing was
    /// reported for that vertex.
    pub fn get_map_for(
        path_params: &HashMap<String, String>,
        store: &MetricStore,
    ) -> Option<HashMap<String, String>> {
        let job_id = path_params.get(Self::JOB_ID_PARAM)?.parse().ok()?;
        let vertex_id = path_params.get(Self::VERTEX_ID_PARAM)?.parse().ok()?;
        store.vertex_metrics(job_id, vertex_id).cloned()
    }
}

#[cfg(test)]
fn params(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn vertex_metrics_lookup() {
    let job = JobId(1);
    let vertex = OperatorId(2);
    let mut store = MetricStore::default();
    store.add_task_metric(job, vertex, SubtaskIndex(0), "abc", 4);
    store.add_operator_metric(job, vertex, SubtaskIndex(1), "counter", "def", "x");

    let found = JobVertexMetricsHandler::get_map_for(
        &params(&[("jobid", job.to_string()), ("vertexid", vertex.to_string())]),
        &store,
    )
    .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found["0.abc"], "4");
    assert_eq!(found["1.counter.def"], "x");
}

#[test]
fn vertex_metrics_missing_params() {
    let mut store = MetricStore::default();
    store.add_task_metric(JobId(1), OperatorId(2), SubtaskIndex(0), "abc", 1);
    assert!(JobVertexMetricsHandler::get_map_for(
        &params(&[("jobid", JobId(1).to_string())]),
        &store
    )
    .is_none());
    assert!(JobVertexMetricsHandler::get_map_for(
        &params(&[("vertexid", OperatorId(2).to_string())]),
        &store
    )
    .is_none());
    assert!(JobVertexMetricsHandler::get_map_for(&params(&[]), &store).is_none());
}

#[test]
fn initialize_twice() {
    initialize_metrics().unwrap();
    initialize_metrics().unwrap();
}
