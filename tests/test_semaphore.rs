// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named counting semaphore: create/open split, timed waits, cross-thread
// signalling.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shmproxy::IpcSemaphore;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_sem_{}_{n}", std::process::id())
}

#[test]
fn create_with_initial_count() {
    let name = unique_name("initial_count");
    let sem = IpcSemaphore::create(&name, 3).expect("create");
    assert_eq!(sem.value().unwrap(), 3);

    for _ in 0..3 {
        assert!(sem.wait(Some(10)).expect("wait"));
    }
    assert!(!sem.wait(Some(10)).expect("wait timeout"));
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn create_replaces_stale_object() {
    let name = unique_name("stale");
    {
        let stale = IpcSemaphore::create(&name, 0).expect("create stale");
        stale.post(5).unwrap();
    }
    let fresh = IpcSemaphore::create(&name, 1).expect("recreate");
    assert_eq!(fresh.value().unwrap(), 1);
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn open_never_creates() {
    let name = unique_name("open_missing");
    IpcSemaphore::clear_storage(&name);
    assert!(IpcSemaphore::open(&name).is_err());
}

#[test]
fn open_shares_count_with_creator() {
    let name = unique_name("shared");
    let owner = IpcSemaphore::create(&name, 0).expect("create");
    let peer = IpcSemaphore::open(&name).expect("open");

    owner.post(2).unwrap();
    assert_eq!(peer.value().unwrap(), 2);
    assert!(peer.try_wait().unwrap());
    assert_eq!(owner.value().unwrap(), 1);
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn try_wait_on_zero() {
    let name = unique_name("try_wait");
    let sem = IpcSemaphore::create(&name, 0).expect("create");
    assert!(!sem.try_wait().unwrap());
    sem.post(1).unwrap();
    assert!(sem.try_wait().unwrap());
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn wait_timeout() {
    let name = unique_name("wait_timeout");
    let sem = IpcSemaphore::create(&name, 0).expect("create");

    let start = Instant::now();
    let waited = sem.wait(Some(50)).expect("wait");
    let elapsed = start.elapsed();

    assert!(!waited, "should timeout");
    assert!(elapsed.as_millis() >= 40, "should have waited ~50ms, got {}ms", elapsed.as_millis());
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn timeout_over_one_second_carries_into_seconds() {
    let name = unique_name("long_timeout");
    let sem = IpcSemaphore::create(&name, 1).expect("create");
    // 1999 ms pushes tv_nsec past one second on most clocks.
    assert!(sem.wait(Some(1999)).expect("wait"));
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn infinite_wait() {
    let name = unique_name("infinite_wait");
    let sem = Arc::new(IpcSemaphore::create(&name, 0).expect("create"));
    let wait_started = Arc::new(AtomicBool::new(false));
    let wait_succeeded = Arc::new(AtomicBool::new(false));

    let sem2 = Arc::clone(&sem);
    let ws = Arc::clone(&wait_started);
    let wsucc = Arc::clone(&wait_succeeded);
    let waiter = thread::spawn(move || {
        ws.store(true, Ordering::SeqCst);
        let result = sem2.wait(None).expect("wait");
        wsucc.store(result, Ordering::SeqCst);
    });

    while !wait_started.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(50));

    sem.post(1).expect("post");

    waiter.join().unwrap();
    assert!(wait_succeeded.load(Ordering::SeqCst));
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn producer_consumer() {
    let name = unique_name("prod_cons");
    let sem = Arc::new(IpcSemaphore::create(&name, 0).expect("create"));
    let consumed = Arc::new(AtomicI32::new(0));
    let count = 10;

    let sem_p = Arc::clone(&sem);
    let producer = thread::spawn(move || {
        for _ in 0..count {
            sem_p.post(1).expect("post");
            thread::sleep(Duration::from_millis(1));
        }
    });

    let sem_c = Arc::clone(&sem);
    let cons = Arc::clone(&consumed);
    let consumer = thread::spawn(move || {
        for _ in 0..count {
            sem_c.wait(None).expect("wait");
            cons.fetch_add(1, Ordering::Relaxed);
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();
    assert_eq!(consumed.load(Ordering::Relaxed), count);
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn separate_handles_in_separate_threads() {
    let name = unique_name("sharing");
    let _owner = IpcSemaphore::create(&name, 0).expect("create");
    let value = Arc::new(AtomicI32::new(0));

    let name1 = name.clone();
    let val1 = Arc::clone(&value);
    let t1 = thread::spawn(move || {
        let sem = IpcSemaphore::open(&name1).expect("open t1");
        sem.wait(None).expect("wait");
        val1.store(100, Ordering::SeqCst);
    });

    let name2 = name.clone();
    let t2 = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let sem = IpcSemaphore::open(&name2).expect("open t2");
        sem.post(1).expect("post");
    });

    t1.join().unwrap();
    t2.join().unwrap();
    assert_eq!(value.load(Ordering::SeqCst), 100);
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn post_multiple() {
    let name = unique_name("post_multiple");
    let sem = IpcSemaphore::create(&name, 0).expect("create");

    sem.post(10).expect("post multiple");
    assert_eq!(sem.value().unwrap(), 10);
    for _ in 0..10 {
        assert!(sem.wait(Some(10)).expect("wait"));
    }
    assert!(!sem.wait(Some(10)).expect("wait empty"));
    IpcSemaphore::clear_storage(&name);
}

#[test]
fn zero_timeout_does_not_hang() {
    let name = unique_name("zero_timeout");
    let sem = IpcSemaphore::create(&name, 0).expect("create");
    assert!(!sem.wait(Some(0)).expect("wait zero timeout"));
    IpcSemaphore::clear_storage(&name);
}
