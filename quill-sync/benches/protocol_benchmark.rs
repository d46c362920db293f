use criterion::{criterion_group, criterion_main, Criterion};
use quill_sync::message::{decode_line, MessageBody, MessageEncoder};
use quill_sync::realtime::document::apply_merge_patch;
use quill_sync::realtime::DocMessage;
use serde_json::{json, Value};
use std::hint::black_box;

fn project_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("project-{i:04}")).collect()
}

fn bench_ipc_encode(c: &mut Criterion) {
    let encoder = MessageEncoder::new();
    let projects = project_ids(100);

    c.bench_function("ipc_encode_project_results_100", |b| {
        b.iter(|| {
            let msg = encoder.encode(MessageBody::ProjectResults {
                projects: black_box(projects.clone()),
            });
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_ipc_decode(c: &mut Criterion) {
    let encoder = MessageEncoder::new();
    let line = encoder
        .encode(MessageBody::ProjectResults {
            projects: project_ids(100),
        })
        .encode()
        .unwrap();
    let ping = encoder.encode(MessageBody::Ping).encode().unwrap();

    c.bench_function("ipc_decode_project_results_100", |b| {
        b.iter(|| black_box(decode_line(black_box(&line)).unwrap()))
    });
    c.bench_function("ipc_decode_ping", |b| {
        b.iter(|| black_box(decode_line(black_box(&ping)).unwrap()))
    });
}

fn chapter_patch() -> Value {
    let verses: serde_json::Map<String, Value> = (1..=30)
        .map(|v| (v.to_string(), Value::String(format!("verse {v} text"))))
        .collect();
    json!({ "verses": verses })
}

fn bench_doc_submit_encode(c: &mut Criterion) {
    let patch = chapter_patch();

    c.bench_function("doc_submit_encode_30_verses", |b| {
        b.iter(|| {
            let msg =
                DocMessage::submit(1, "texts", "p1:1:1:target", black_box(7), black_box(&patch))
                    .unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_doc_op_decode(c: &mut Criterion) {
    let encoded = DocMessage::op("texts", "p1:1:1:target", 8, &chapter_patch())
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("doc_op_decode_30_verses", |b| {
        b.iter(|| {
            let msg = DocMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.json_payload().unwrap());
        })
    });
}

fn bench_merge_patch(c: &mut Criterion) {
    let patch = chapter_patch();
    let base = json!({ "verses": { "1": "old", "31": "kept" }, "notes": null });

    c.bench_function("merge_patch_30_verses", |b| {
        b.iter(|| {
            let mut doc = base.clone();
            apply_merge_patch(&mut doc, black_box(&patch));
            black_box(doc);
        })
    });
}

criterion_group!(
    benches,
    bench_ipc_encode,
    bench_ipc_decode,
    bench_doc_submit_encode,
    bench_doc_op_decode,
    bench_merge_patch,
);
criterion_main!(benches);
