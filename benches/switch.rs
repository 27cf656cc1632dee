//! Fiber switch and spawn throughput benchmarks using criterion.
//!
//! Measures the dispatcher round trip (yield -> dispatch -> resume) and
//! the full spawn/terminate cycle through the public API.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use weft::{Runtime, RuntimeConfig};

fn bench_yield_round_trip(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig {
        workers: 1,
        ..RuntimeConfig::default()
    })
    .unwrap();

    c.bench_function("yield_round_trip_x1000", |b| {
        b.iter(|| {
            let fid = rt
                .spawn(|| {
                    for _ in 0..1000 {
                        weft::yield_now();
                    }
                })
                .expect("out of fiber slots");
            rt.wait(fid);
        });
    });

    rt.shutdown().unwrap();
}

fn bench_spawn_wait(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig {
        workers: 1,
        ..RuntimeConfig::default()
    })
    .unwrap();

    c.bench_function("spawn_wait", |b| {
        b.iter(|| {
            let fid = rt.spawn(|| {}).expect("out of fiber slots");
            rt.wait(fid);
        });
    });

    rt.shutdown().unwrap();
}

fn bench_cross_core_handoff(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig {
        workers: 2,
        ..RuntimeConfig::default()
    })
    .unwrap();

    c.bench_function("cross_core_join", |b| {
        b.iter(|| {
            let release = Arc::new(AtomicBool::new(false));
            let release_target = release.clone();
            let target = rt
                .spawn_on(0, move || {
                    while !release_target.load(Ordering::SeqCst) {
                        weft::yield_now();
                    }
                })
                .expect("out of fiber slots");
            let joiner = rt
                .spawn_on(1, move || {
                    weft::join(target);
                })
                .expect("out of fiber slots");
            release.store(true, Ordering::SeqCst);
            rt.wait(joiner);
        });
    });

    rt.shutdown().unwrap();
}

criterion_group!(
    benches,
    bench_yield_round_trip,
    bench_spawn_wait,
    bench_cross_core_handoff
);
criterion_main!(benches);
