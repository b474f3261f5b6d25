//! Helpers for tests of jobs.
//!
//! Latches are created by the test and moved into the source or
//! operator factories, so every job gets its own and nothing is shared
//! between tests running in parallel.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::errors::Error;
use crate::errors::Result;
use crate::model::*;
use crate::runtime::OperatorContext;
use crate::runtime::Record;
use crate::runtime::SourceFunction;
use crate::runtime::SourcePoll;
use crate::runtime::StreamOperator;
use crate::runtime::SubtaskInfo;
use crate::state::BoolSerializer;
use crate::state::Namespace;
use crate::state::ValueStateDescriptor;
use crate::storage::FileSystem;
use crate::storage::LocalFileSystem;

/// Releases waiters once it was counted down `count` times.
#[derive(Debug, Clone)]
pub struct CountDownLatch {
    count: Arc<watch::Sender<usize>>,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        let (count, _) = watch::channel(count);
        Self {
            count: Arc::new(count),
        }
    }

    pub fn count_down(&self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn get_count(&self) -> usize {
        *self.count.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        while *rx.borrow_and_update() > 0 {
            // The sender lives in `self`, so this can't close.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A latch that is triggered once.
#[derive(Debug, Clone)]
pub struct OneShotLatch(CountDownLatch);

impl Default for OneShotLatch {
    fn default() -> Self {
        Self(CountDownLatch::new(1))
    }
}

impl OneShotLatch {
    pub fn trigger(&self) {
        self.0.count_down();
    }

    pub fn is_triggered(&self) -> bool {
        self.0.get_count() == 0
    }

    pub async fn wait(&self) {
        self.0.wait().await;
    }
}

/// Emits an endless stream of records and keeps no state.
#[derive(Debug, Default)]
pub struct InfiniteTestSource {
    next: u64,
}

impl SourceFunction for InfiniteTestSource {
    fn poll_next(&mut self, _info: &SubtaskInfo) -> Result<SourcePoll> {
        let n = self.next;
        self.next += 1;
        Ok(SourcePoll::Ready(Record::new(
            n.to_be_bytes().to_vec(),
            Vec::new(),
        )))
    }
}

/// Counts the records it emits and snapshots the count together with
/// a blob of opaque bytes as its non-keyed state.
///
/// Counts its latch down once after emitting its first record, so a
/// test knows the task is up.
#[derive(Debug)]
pub struct StatefulCounter {
    latch: CountDownLatch,
    counted_down: bool,
    count: u64,
    data: Vec<u8>,
}

impl StatefulCounter {
    pub fn new(latch: CountDownLatch) -> Self {
        Self::with_state_size(latch, 100)
    }

    /// `size` bytes of random data go into every snapshot on top of
    /// the count.
    pub fn with_state_size(latch: CountDownLatch, size: usize) -> Self {
        Self {
            latch,
            counted_down: false,
            count: 0,
            data: std::iter::repeat_with(|| fastrand::u8(..)).take(size).collect(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Split a snapshot into count and data.
    pub fn decode_state(state: &[u8]) -> Result<(u64, Vec<u8>)> {
        if state.len() < 8 {
            return Err(Error::corrupt(format!(
                "counter state needs at least 8 bytes, got {}",
                state.len()
            )));
        }
        let (count, data) = state.split_at(8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(count);
        Ok((u64::from_be_bytes(buf), data.to_vec()))
    }
}

impl SourceFunction for StatefulCounter {
    fn poll_next(&mut self, _info: &SubtaskInfo) -> Result<SourcePoll> {
        self.count += 1;
        if !self.counted_down {
            self.counted_down = true;
            self.latch.count_down();
        }
        Ok(SourcePoll::Ready(Record::new(
            self.count.to_be_bytes().to_vec(),
            Vec::new(),
        )))
    }

    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> Result<Option<Vec<u8>>> {
        let mut state = self.count.to_be_bytes().to_vec();
        state.extend_from_slice(&self.data);
        Ok(Some(state))
    }

    fn restore_state(&mut self, _info: &SubtaskInfo, state: Vec<u8>) -> Result<()> {
        let (count, data) = Self::decode_state(&state)?;
        self.count = count;
        self.data = data;
        Ok(())
    }
}

/// Emits the integers `0..` whose keys this subtask owns, each
/// `repeats` times, and finishes after `limit` records.
///
/// Keys and values are the big endian bytes of the integer. Its
/// position is non-keyed state, so a restored source continues where
/// the snapshot left off.
#[derive(Debug)]
pub struct IntegerStreamSource {
    limit: u64,
    repeats: u64,
    next: u64,
    emitted: u64,
}

impl IntegerStreamSource {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            repeats: 1,
            next: 0,
            emitted: 0,
        }
    }

    pub fn with_repeats(mut self, repeats: u64) -> Self {
        self.repeats = repeats.max(1);
        self
    }
}

impl SourceFunction for IntegerStreamSource {
    fn poll_next(&mut self, info: &SubtaskInfo) -> Result<SourcePoll> {
        if self.emitted >= self.limit {
            return Ok(SourcePoll::Finished);
        }
        loop {
            let n = self.next / self.repeats;
            let key = n.to_be_bytes();
            if info.owns_key(&key) {
                self.next += 1;
                self.emitted += 1;
                return Ok(SourcePoll::Ready(Record::new(key.to_vec(), key.to_vec())));
            }
            // Skip every repeat of an integer owned by another subtask.
            self.next += self.repeats;
        }
    }

    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> Result<Option<Vec<u8>>> {
        let mut state = self.next.to_be_bytes().to_vec();
        state.extend_from_slice(&self.emitted.to_be_bytes());
        Ok(Some(state))
    }

    fn restore_state(&mut self, _info: &SubtaskInfo, state: Vec<u8>) -> Result<()> {
        if state.len() != 16 {
            return Err(Error::corrupt(format!(
                "integer source state must be 16 bytes, got {}",
                state.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&state[..8]);
        self.next = u64::from_be_bytes(buf);
        buf.copy_from_slice(&state[8..]);
        self.emitted = u64::from_be_bytes(buf);
        Ok(())
    }
}

/// Forwards the first record of every key and drops the rest.
///
/// Needs a keyed state backend on its vertex.
#[derive(Debug)]
pub struct DuplicateFilter {
    seen: ValueStateDescriptor<bool>,
    namespace: Namespace,
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self {
            seen: ValueStateDescriptor::new("seen", BoolSerializer).with_default(false),
            namespace: Namespace::void(),
        }
    }
}

impl StreamOperator for DuplicateFilter {
    fn process(&mut self, record: Record, ctx: &mut OperatorContext<'_>) -> Result<()> {
        let mut seen = ctx
            .keyed_state()?
            .get_or_create_value_state(&self.namespace, &self.seen)?;
        if seen.value()?.unwrap_or(false) {
            return Ok(());
        }
        seen.update(&true)?;
        ctx.emit(record);
        Ok(())
    }
}

/// Collects every record it sees into a shared vector.
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl CollectSink {
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn distinct_keys(&self) -> HashSet<Vec<u8>> {
        self.records().into_iter().map(|r| r.key).collect()
    }
}

impl StreamOperator for CollectSink {
    fn process(&mut self, record: Record, _ctx: &mut OperatorContext<'_>) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .push(record);
        Ok(())
    }
}

/// Local file system whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyFileSystem {
    inner: LocalFileSystem,
    fail_writes: AtomicBool,
    failed_writes: AtomicUsize,
}

impl FlakyFileSystem {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes refused so far.
    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }
}

impl FileSystem for FlakyFileSystem {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected write failure for {path:?}"),
            )));
        }
        self.inner.write_file(path, data)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn read_range(&self, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.inner.read_range(path, offset, length)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.inner.delete_file(path)
    }

    fn delete_dir(&self, path: &Path, recursive: bool) -> Result<()> {
        self.inner.delete_dir(path, recursive)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_dir(path)
    }
}

/// Every file below `dir`, recursively.
pub fn files_below(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut dirs = vec![dir.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
fn info(parallelism: u32, index: u32) -> SubtaskInfo {
    SubtaskInfo {
        job_id: JobId(1),
        operator_id: OperatorId(1),
        vertex_name: "ints".to_owned(),
        subtask_index: SubtaskIndex(index),
        parallelism,
        max_parallelism: 16,
        key_group_range: KeyGroupRange::for_subtask(16, parallelism, index),
        attempt: 0,
    }
}

#[tokio::test]
async fn latch_releases_waiters() {
    let latch = CountDownLatch::new(2);
    let waiter = {
        let latch = latch.clone();
        tokio::spawn(async move { latch.wait().await })
    };
    latch.count_down();
    assert_eq!(latch.get_count(), 1);
    latch.count_down();
    latch.count_down();
    assert_eq!(latch.get_count(), 0);
    waiter.await.unwrap();
    // Already released.
    latch.wait().await;

    let once = OneShotLatch::default();
    assert!(!once.is_triggered());
    once.trigger();
    once.wait().await;
}

#[test]
fn integer_source_splits_keys_and_resumes() {
    let infos = [info(2, 0), info(2, 1)];
    let mut seen = HashSet::new();
    for info in &infos {
        let mut source = IntegerStreamSource::new(10);
        for _ in 0..10 {
            match source.poll_next(info).unwrap() {
                SourcePoll::Ready(record) => {
                    assert!(info.owns_key(&record.key));
                    assert!(seen.insert(record.key));
                }
                other => panic!("expected record, got {other:?}"),
            }
        }
        assert_eq!(source.poll_next(info).unwrap(), SourcePoll::Finished);
    }

    let info = info(1, 0);
    let mut source = IntegerStreamSource::new(4).with_repeats(2);
    let first = source.poll_next(&info).unwrap();
    let state = source.snapshot_state(CheckpointId(1)).unwrap().unwrap();
    let mut restored = IntegerStreamSource::new(4).with_repeats(2);
    restored.restore_state(&info, state).unwrap();
    assert_eq!(restored.poll_next(&info).unwrap(), first);
    assert!(matches!(
        restored.poll_next(&info).unwrap(),
        SourcePoll::Ready(_)
    ));
    assert!(matches!(
        restored.poll_next(&info).unwrap(),
        SourcePoll::Ready(_)
    ));
    assert_eq!(restored.poll_next(&info).unwrap(), SourcePoll::Finished);
}

#[test]
fn stateful_counter_round_trips_state() {
    let latch = CountDownLatch::new(1);
    let info = info(1, 0);
    let mut counter = StatefulCounter::with_state_size(latch.clone(), 16);
    counter.poll_next(&info).unwrap();
    counter.poll_next(&info).unwrap();
    assert_eq!(latch.get_count(), 0);
    let state = counter.snapshot_state(CheckpointId(1)).unwrap().unwrap();
    assert_eq!(state.len(), 24);

    let mut restored = StatefulCounter::with_state_size(CountDownLatch::new(1), 0);
    restored.restore_state(&info, state).unwrap();
    assert_eq!(restored.count(), 2);
    assert!(restored.restore_state(&info, vec![1, 2]).is_err());
}
