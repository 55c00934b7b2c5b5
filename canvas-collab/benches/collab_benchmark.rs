use canvas_collab::broadcast::BroadcastGroup;
use canvas_collab::protocol::{AwarenessState, SyncMessage};
use canvas_collab::storage::LogRecord;
use canvas_core::{CanvasId, Intent, Operation, Replica, ReplicaId, StateVector, ROOT};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;

fn batch(count: usize) -> Vec<Operation> {
    let mut replica = Replica::new(ReplicaId::random());
    (0..count)
        .map(|i| {
            replica
                .local_mutate(Intent::insert(ROOT, None, "rect").with_attribute("x", json!(i)))
                .unwrap()
        })
        .collect()
}

fn canvas() -> CanvasId {
    CanvasId::parse("bench").unwrap()
}

fn bench_update_encode(c: &mut Criterion) {
    let replica = ReplicaId::random();
    let ops = batch(32);

    c.bench_function("update_encode_32_ops", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(replica), canvas(), black_box(&ops)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::update(ReplicaId::random(), canvas(), &batch(32)).unwrap();
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_32_ops", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operations().unwrap());
        })
    });
}

fn bench_state_vector_encode(c: &mut Criterion) {
    let sv: StateVector = (0..64).map(|i| (ReplicaId::random(), i as u64 * 7)).collect();

    c.bench_function("sync_step1_encode_64_replicas", |b| {
        b.iter(|| {
            let msg = SyncMessage::sync_step1(ReplicaId::random(), canvas(), black_box(&sv)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let replica = ReplicaId::random();
    let state = AwarenessState {
        name: "Alice".into(),
        cursor: Some([100.0, 200.0]),
        ..Default::default()
    };

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(replica, canvas(), black_box(&state)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..16)
        .map(|_| group.add_peer(ReplicaId::random(), StateVector::new()))
        .collect();
    let msg = SyncMessage::update(ReplicaId::random(), canvas(), &batch(4)).unwrap();

    c.bench_function("broadcast_16_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast(msg.clone()));
            for rx in receivers.iter_mut() {
                let _ = rx.try_recv();
            }
        })
    });
}

fn bench_log_record_encode(c: &mut Criterion) {
    let ops = batch(16);

    c.bench_function("log_record_encode_16_ops", |b| {
        b.iter(|| {
            let record = LogRecord::new(black_box(7), canvas(), black_box(&ops)).unwrap();
            black_box(record.encode().unwrap());
        })
    });
}

fn bench_log_record_decode(c: &mut Criterion) {
    let encoded = LogRecord::new(7, canvas(), &batch(16))
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("log_record_decode_16_ops", |b| {
        b.iter(|| {
            let record = LogRecord::decode(black_box(&encoded)).unwrap();
            black_box(record.operations().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_state_vector_encode,
    bench_awareness_encode,
    bench_broadcast,
    bench_log_record_encode,
    bench_log_record_decode,
);
criterion_main!(benches);
