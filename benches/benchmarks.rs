use std::collections::HashMap;

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BatchSize;
use criterion::Criterion;
use snapflow::model::*;
use snapflow::query::*;
use snapflow::state::*;
use snapflow::storage::LocalFileSystem;

const MAX_PARALLELISM: u32 = 128;
const KEYS: u64 = 10_000;

fn filled_backend() -> KeyedStateBackend<Vec<u8>> {
    let range = KeyGroupRange::for_subtask(MAX_PARALLELISM, 1, 0);
    let mut backend = KeyedStateBackend::heap(BytesSerializer, MAX_PARALLELISM, range);
    let values = ValueStateDescriptor::new("count", I64Serializer);
    let lists = ListStateDescriptor::new("history", I64Serializer);
    let ns = Namespace::void();
    for key in 0..KEYS {
        backend.set_current_key(&key.to_be_bytes().to_vec()).unwrap();
        backend
            .get_or_create_value_state(&ns, &values)
            .unwrap()
            .update(&(key as i64))
            .unwrap();
        let mut list = backend.get_or_create_list_state(&ns, &lists).unwrap();
        for i in 0..4 {
            list.add(&i).unwrap();
        }
    }
    backend
}

fn snapshot_benchmark(c: &mut Criterion) {
    let mut backend = filled_backend();
    c.bench_function("heap_snapshot_10k_keys", |b| {
        b.iter(|| black_box(backend.snapshot(CheckpointId(1)).unwrap()))
    });

    let handle = backend.snapshot(CheckpointId(1)).unwrap();
    let range = KeyGroupRange::for_subtask(MAX_PARALLELISM, 1, 0);
    c.bench_function("heap_restore_10k_keys", |b| {
        b.iter_batched(
            || KeyedStateBackend::heap(BytesSerializer, MAX_PARALLELISM, range),
            |mut restored| {
                restored
                    .restore(std::slice::from_ref(&handle), &LocalFileSystem)
                    .unwrap();
                restored
            },
            BatchSize::SmallInput,
        )
    });

    // Rescaling reads only the key groups each new subtask owns.
    c.bench_function("heap_restore_one_of_four", |b| {
        let quarter = KeyGroupRange::for_subtask(MAX_PARALLELISM, 4, 1);
        let narrowed = handle.intersection(&quarter).unwrap().unwrap();
        b.iter_batched(
            || KeyedStateBackend::heap(BytesSerializer, MAX_PARALLELISM, quarter),
            |mut restored| {
                restored
                    .restore(std::slice::from_ref(&narrowed), &LocalFileSystem)
                    .unwrap();
                restored
            },
            BatchSize::SmallInput,
        )
    });
}

fn wire_benchmark(c: &mut Criterion) {
    let map: HashMap<String, i64> = (0..1_000).map(|i| (format!("key-{i}"), i)).collect();
    let list: Vec<i64> = (0..1_000).collect();

    c.bench_function("serialize_map_1k", |b| {
        b.iter(|| {
            black_box(serialize_map(
                map.iter().map(|(k, v)| (k, Some(v))),
                &StringSerializer,
                &I64Serializer,
            ))
        })
    });
    let map_bytes = serialize_map(
        map.iter().map(|(k, v)| (k, Some(v))),
        &StringSerializer,
        &I64Serializer,
    );
    c.bench_function("deserialize_map_1k", |b| {
        b.iter(|| {
            black_box(deserialize_map(&map_bytes, &StringSerializer, &I64Serializer).unwrap())
        })
    });

    c.bench_function("serialize_list_1k", |b| {
        b.iter(|| black_box(serialize_list(&list, &I64Serializer)))
    });
    let list_bytes = serialize_list(&list, &I64Serializer);
    c.bench_function("deserialize_list_1k", |b| {
        b.iter(|| black_box(deserialize_list(&list_bytes, &I64Serializer).unwrap()))
    });

    c.bench_function("key_and_namespace", |b| {
        b.iter(|| {
            let bytes = serialize_key_and_namespace(
                &black_box(7i64),
                &I64Serializer,
                &VoidNamespace,
                &VoidNamespaceSerializer,
            );
            black_box(
                deserialize_key_and_namespace(&bytes, &I64Serializer, &VoidNamespaceSerializer)
                    .unwrap(),
            )
        })
    });
}

criterion_group!(benches, snapshot_benchmark, wire_benchmark);
criterion_main!(benches);
