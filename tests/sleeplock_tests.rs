//! Exclusive sleep lock behavior under contention.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weft::{Runtime, RuntimeConfig, SleepLock};

fn runtime(workers: usize) -> Runtime {
    Runtime::new(RuntimeConfig {
        workers,
        ..RuntimeConfig::default()
    })
    .expect("runtime construction failed")
}

#[test]
fn lock_is_mutually_exclusive() {
    let rt = runtime(3);
    let lock = Arc::new(SleepLock::new());
    let holders = Arc::new(AtomicU32::new(0));

    let mut fibers = Vec::new();
    for core in 0..3 {
        for _ in 0..4 {
            let lock = lock.clone();
            let holders = holders.clone();
            fibers.push(
                rt.spawn_on(core, move || {
                    for _ in 0..50 {
                        lock.lock();
                        // Exactly one fiber may be inside at a time.
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        weft::yield_now();
                        assert_eq!(holders.fetch_sub(1, Ordering::SeqCst), 1);
                        lock.unlock();
                    }
                })
                .expect("spawn failed"),
            );
        }
    }
    for fid in fibers {
        rt.wait(fid);
    }
    assert!(!lock.owned());
    rt.shutdown().unwrap();
}

#[test]
fn waiters_acquire_in_fifo_order() {
    let rt = runtime(3);
    let lock = Arc::new(SleepLock::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let release = Arc::new(AtomicBool::new(false));
    let first_arrived = Arc::new(AtomicBool::new(false));

    // Core 0 takes the lock and sits on it until told to let go.
    let holder_lock = lock.clone();
    let holder_release = release.clone();
    let holder = rt
        .spawn_on(0, move || {
            holder_lock.lock();
            while !holder_release.load(Ordering::SeqCst) {
                weft::yield_now();
            }
            holder_lock.unlock();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));

    // Core 1 parks first, core 2 second.
    let lock1 = lock.clone();
    let order1 = order.clone();
    let arrived1 = first_arrived.clone();
    let waiter1 = rt
        .spawn_on(1, move || {
            arrived1.store(true, Ordering::SeqCst);
            lock1.lock();
            order1.lock().unwrap().push(1);
            lock1.unlock();
        })
        .unwrap();

    while !first_arrived.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    // Let waiter 1 actually reach the wait queue before waiter 2 starts.
    std::thread::sleep(Duration::from_millis(50));

    let lock2 = lock.clone();
    let order2 = order.clone();
    let waiter2 = rt
        .spawn_on(2, move || {
            lock2.lock();
            order2.lock().unwrap().push(2);
            lock2.unlock();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    release.store(true, Ordering::SeqCst);

    rt.wait(holder);
    rt.wait(waiter1);
    rt.wait(waiter2);

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    rt.shutdown().unwrap();
}

#[test]
fn try_lock_never_parks() {
    let rt = runtime(1);
    let lock = Arc::new(SleepLock::new());
    let release = Arc::new(AtomicBool::new(false));

    let holder_lock = lock.clone();
    let holder_release = release.clone();
    let holder = rt
        .spawn(move || {
            assert!(holder_lock.try_lock());
            while !holder_release.load(Ordering::SeqCst) {
                weft::yield_now();
            }
            holder_lock.unlock();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));

    let contender_lock = lock.clone();
    let contender_release = release.clone();
    let contender = rt
        .spawn(move || {
            assert!(!contender_lock.try_lock());
            contender_release.store(true, Ordering::SeqCst);
            // The holder frees the lock once the flag is up.
            loop {
                if contender_lock.try_lock() {
                    break;
                }
                weft::yield_now();
            }
            contender_lock.unlock();
        })
        .unwrap();

    rt.wait(holder);
    rt.wait(contender);
    assert!(!lock.owned());
    rt.shutdown().unwrap();
}

#[test]
fn owned_tracks_the_holder() {
    let rt = runtime(1);
    let lock = Arc::new(SleepLock::new());
    assert!(!lock.owned());

    let fiber_lock = lock.clone();
    let fid = rt
        .spawn(move || {
            fiber_lock.lock();
            assert!(fiber_lock.owned());
            fiber_lock.unlock();
            assert!(!fiber_lock.owned());
        })
        .unwrap();
    rt.wait(fid);
    rt.shutdown().unwrap();
}

#[test]
fn handoff_crosses_cores_promptly() {
    let rt = runtime(2);
    let lock = Arc::new(SleepLock::new());
    let acquired = Arc::new(AtomicBool::new(false));

    let holder_lock = lock.clone();
    let holder = rt
        .spawn_on(0, move || {
            holder_lock.lock();
            weft::sleep(Duration::from_millis(50));
            holder_lock.unlock();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));

    let waiter_lock = lock.clone();
    let waiter_acquired = acquired.clone();
    let waiter = rt
        .spawn_on(1, move || {
            waiter_lock.lock();
            waiter_acquired.store(true, Ordering::SeqCst);
            waiter_lock.unlock();
        })
        .unwrap();

    rt.wait(holder);
    // The wake rides core 1's ring; it must land within a dispatch pass
    // or two, not after another scheduling quantum.
    let start = std::time::Instant::now();
    while !acquired.load(Ordering::SeqCst) {
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "cross-core handoff took too long"
        );
        std::thread::yield_now();
    }
    rt.wait(waiter);
    rt.shutdown().unwrap();
}
