//! Spawn placement, stale identity, and external wakeups across cores.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::{Runtime, RuntimeConfig};

fn runtime(workers: usize) -> Runtime {
    Runtime::new(RuntimeConfig {
        workers,
        ..RuntimeConfig::default()
    })
    .expect("runtime construction failed")
}

#[test]
fn spawn_on_pins_to_the_requested_core() {
    let rt = runtime(4);
    for core in 0..4 {
        let fid = rt.spawn_on(core, || {}).expect("spawn failed");
        assert_eq!(fid.core(), core);
        rt.wait(fid);
    }
    rt.shutdown().unwrap();
}

#[test]
fn default_placement_spreads_load() {
    let rt = runtime(4);
    let release = Arc::new(AtomicBool::new(false));

    let mut fibers = Vec::new();
    let mut cores_used = [false; 4];
    for _ in 0..8 {
        let release = release.clone();
        let fid = rt
            .spawn(move || {
                while !release.load(Ordering::SeqCst) {
                    weft::yield_now();
                }
            })
            .expect("spawn failed");
        cores_used[fid.core()] = true;
        fibers.push(fid);
    }
    // Least-loaded placement touches every core before doubling up.
    assert!(cores_used.iter().all(|&used| used), "{cores_used:?}");

    release.store(true, Ordering::SeqCst);
    for fid in fibers {
        rt.wait(fid);
    }
    rt.shutdown().unwrap();
}

#[test]
fn many_fibers_across_cores_all_complete() {
    let rt = runtime(4);
    let completed = Arc::new(AtomicUsize::new(0));

    let mut fibers = Vec::new();
    for index in 0..100 {
        let completed = completed.clone();
        fibers.push(
            rt.spawn(move || {
                for _ in 0..(index % 7) {
                    weft::yield_now();
                }
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn failed"),
        );
    }
    for fid in fibers {
        rt.wait(fid);
    }
    assert_eq!(completed.load(Ordering::SeqCst), 100);
    rt.shutdown().unwrap();
}

#[test]
fn join_chain_across_cores() {
    let rt = runtime(3);
    let trace = Arc::new(AtomicUsize::new(0));

    let trace_a = trace.clone();
    let a = rt
        .spawn_on(0, move || {
            weft::sleep(Duration::from_millis(10));
            trace_a.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let trace_b = trace.clone();
    let b = rt
        .spawn_on(1, move || {
            weft::join(a);
            assert!(trace_b.load(Ordering::SeqCst) >= 1);
            trace_b.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();

    let trace_c = trace.clone();
    let c = rt
        .spawn_on(2, move || {
            weft::join(b);
            assert!(trace_c.load(Ordering::SeqCst) >= 11);
            trace_c.fetch_add(100, Ordering::SeqCst);
        })
        .unwrap();

    rt.wait(c);
    assert_eq!(trace.load(Ordering::SeqCst), 111);
    rt.shutdown().unwrap();
}

#[test]
fn stale_signal_does_not_touch_the_slot_reuser() {
    let rt = runtime(1);

    // B exits; its slot is recycled by C. A stale wake aimed at B must
    // not perturb C.
    let b = rt.spawn(|| {}).unwrap();
    rt.wait(b);
    std::thread::sleep(Duration::from_millis(20));

    let c_parked = Arc::new(AtomicBool::new(false));
    let c_release = Arc::new(AtomicBool::new(false));
    let parked_clone = c_parked.clone();
    let release_clone = c_release.clone();
    let c = rt
        .spawn(move || {
            parked_clone.store(true, Ordering::SeqCst);
            while !release_clone.load(Ordering::SeqCst) {
                weft::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

    while !c_parked.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    // The stale id is dropped at the generation check; C stays parked on
    // its own schedule.
    rt.schedule(b);
    std::thread::sleep(Duration::from_millis(30));
    assert!(rt.alive(c));

    c_release.store(true, Ordering::SeqCst);
    rt.wait(c);
    rt.shutdown().unwrap();
}

#[test]
fn schedule_of_a_live_fiber_is_a_harmless_spurious_wake() {
    let rt = runtime(2);
    let release = Arc::new(AtomicBool::new(false));
    let release_clone = release.clone();

    let fid = rt
        .spawn(move || {
            while !release_clone.load(Ordering::SeqCst) {
                weft::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

    // Hammer it with external wakes while it sleeps; every one is either
    // consumed as a spurious wake or dropped, never corrupting state.
    for _ in 0..50 {
        rt.schedule(fid);
        std::thread::sleep(Duration::from_millis(1));
    }

    release.store(true, Ordering::SeqCst);
    rt.wait(fid);
    rt.shutdown().unwrap();
}
