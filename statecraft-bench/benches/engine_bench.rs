//! Microstep engine and interpreter benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use statecraft_core::{Document, Event, HistoryValues, MicroStep};
use statecraft_interp::{Interpreter, InterpreterConfig};
use std::sync::Arc;
use std::time::Duration;

/// A ring of `n` states advanced by `next`.
fn ring(n: usize) -> serde_json::Value {
    let states: Vec<serde_json::Value> = (0..n)
        .map(|i| {
            let actions = if i + 1 == n {
                serde_json::json!([{"kind": "script", "source": "laps = laps + 1"}])
            } else {
                serde_json::json!([])
            };
            serde_json::json!({
                "id": format!("s{}", i),
                "transitions": [{
                    "event": "next",
                    "target": format!("s{}", (i + 1) % n),
                    "actions": actions
                }]
            })
        })
        .collect();
    serde_json::json!({
        "name": "ring",
        "data": [{"id": "laps", "expr": "0"}],
        "states": states
    })
}

/// `regions` parallel regions, each a compound state with two children.
fn parallel(regions: usize) -> serde_json::Value {
    serde_json::json!({
        "name": "parallel",
        "states": [{
            "id": "p",
            "kind": "parallel",
            "states": (0..regions).map(|r| serde_json::json!({
                "id": format!("r{}", r),
                "states": [
                    {"id": format!("r{}_a", r), "transitions": [{"event": "flip", "target": format!("r{}_b", r)}]},
                    {"id": format!("r{}_b", r), "transitions": [{"event": "flip", "target": format!("r{}_a", r)}]}
                ]
            })).collect::<Vec<_>>()
        }]
    })
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_load");
    for n in [10usize, 100, 1000] {
        let json = ring(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("ring", n), &json, |b, json| {
            b.iter(|| black_box(Document::from_json(json).unwrap()))
        });
    }
    group.finish();
}

fn bench_microstep(c: &mut Criterion) {
    let mut group = c.benchmark_group("microstep");
    for regions in [2usize, 8, 32] {
        let doc = Document::from_json(&parallel(regions)).unwrap();
        let engine = MicroStep::new(&doc);
        let history = HistoryValues::new();
        let config = engine
            .initial_plan(&history)
            .next_configuration(&Default::default());

        group.bench_with_input(BenchmarkId::new("parallel_flip", regions), &config, |b, config| {
            b.iter(|| {
                let transitions =
                    engine.select_transitions(config, &history, Some("flip"), |_, _| true);
                black_box(engine.plan(config, &history, transitions))
            })
        });
    }
    group.finish();
}

fn bench_interpreter_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_step");
    group.throughput(Throughput::Elements(1));

    let doc = Arc::new(Document::from_json(&ring(16)).unwrap());
    let interp = Interpreter::new(Arc::clone(&doc), InterpreterConfig::new()).unwrap();
    interp.step(Some(Duration::ZERO)).unwrap();

    group.bench_function("ring_next", |b| {
        b.iter(|| {
            interp.send(Event::external("next"));
            black_box(interp.step(Some(Duration::ZERO)).unwrap())
        })
    });

    group.bench_function("serialize", |b| b.iter(|| black_box(interp.serialize().unwrap())));
    group.finish();
}

criterion_group!(benches, bench_load, bench_microstep, bench_interpreter_step);
criterion_main!(benches);
