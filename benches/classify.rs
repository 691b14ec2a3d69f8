//! Performance benchmarks for event classification and the relational log

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fsrelay::classify::{classify, OperationDescriptor, Surface};
use fsrelay::storage::{EventLog, ReadRequest, SqliteBackend};
use serde_json::json;

fn sample_operations() -> Vec<OperationDescriptor> {
    let mut move_op = OperationDescriptor {
        surface: Some(Surface::Dav),
        method: "MOVE".into(),
        path: "/dav/photos/2024/IMG%200001.jpg".into(),
        status: 201,
        ..Default::default()
    };
    move_op.headers.insert(
        "Destination".into(),
        "http://proxy.local:5245/dav/archive/IMG%200001.jpg".into(),
    );

    let mut form_op = OperationDescriptor {
        method: "PUT".into(),
        path: "/api/fs/form".into(),
        status: 200,
        response: Some(json!({"code": 200, "message": "success", "data": null})),
        ..Default::default()
    };
    form_op
        .headers
        .insert("File-Path".into(), "%2Fdocs%2Freport.pdf".into());

    let rename_op = OperationDescriptor {
        method: "POST".into(),
        path: "/api/fs/rename".into(),
        status: 200,
        body: Some(json!({"path": "/docs/a.txt", "name": "b.txt"})),
        response: Some(json!({"code": 200, "message": "success", "data": null})),
        ..Default::default()
    };

    let mkcol_op = OperationDescriptor {
        method: "MKCOL".into(),
        path: "/dav/new%20folder/".into(),
        status: 201,
        ..Default::default()
    };

    vec![move_op, form_op, rename_op, mkcol_op]
}

fn bench_classify(c: &mut Criterion) {
    let ops = sample_operations();
    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(ops.len() as u64));

    group.bench_function("mixed_surfaces", |b| {
        b.iter(|| {
            for op in &ops {
                black_box(classify(black_box(op)));
            }
        })
    });

    let failed = OperationDescriptor {
        status: 404,
        ..ops[0].clone()
    };
    group.bench_function("failed_operation", |b| {
        b.iter(|| black_box(classify(black_box(&failed))))
    });

    group.finish();
}

fn bench_relational_log(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let events: Vec<_> = sample_operations().iter().flat_map(classify).collect();

    let mut group = c.benchmark_group("relational_log");

    group.bench_function("append", |b| {
        let log = SqliteBackend::ephemeral("events").unwrap();
        b.iter(|| {
            rt.block_on(async {
                for event in &events {
                    black_box(log.append(event).await.unwrap());
                }
            })
        })
    });

    for size in [100usize, 1000] {
        let log = SqliteBackend::ephemeral("events").unwrap();
        rt.block_on(async {
            for i in 0..size {
                log.append(&events[i % events.len()]).await.unwrap();
            }
        });

        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::new("read_batch", size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(log.read(&ReadRequest::after(None, 100)).await.unwrap())
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_relational_log);
criterion_main!(benches);
