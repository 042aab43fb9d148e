// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proxy and cache daemon running in one process, talking over real POSIX
// objects exactly as they would across processes.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use shmproxy::{
    CacheDaemon, CacheProxy, CommandChannel, ContentReader, ContentStore, DaemonConfig,
    DaemonShutdown, Delivery, Error, MemorySink, MemoryStore, ProxyConfig, RequestHandler,
    ResponseSink, ResponseStatus, SharedSegment, TimeoutPolicy,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_prefix(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{}_{n}", std::process::id())
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn proxy_config(prefix: &str, segments: usize, size: usize) -> ProxyConfig {
    let channel_name = format!("/{prefix}_cmd");
    CommandChannel::unlink(&channel_name);
    ProxyConfig {
        segment_count: segments,
        segment_size: size,
        segment_prefix: prefix.to_string(),
        channel_name,
        ready_timeout: Some(Duration::from_secs(5)),
        timeout_policy: TimeoutPolicy::FailRequest,
        ..ProxyConfig::default()
    }
}

struct RunningDaemon {
    handle: DaemonShutdown,
    thread: JoinHandle<shmproxy::Result<()>>,
}

impl RunningDaemon {
    fn start(channel_name: &str, store: Arc<dyn ContentStore>, workers: usize) -> Self {
        Self::start_with(channel_name, store, workers, Some(Duration::from_secs(5)))
    }

    fn start_with(
        channel_name: &str,
        store: Arc<dyn ContentStore>,
        workers: usize,
        release_timeout: Option<Duration>,
    ) -> Self {
        let config = DaemonConfig {
            channel_name: channel_name.to_string(),
            worker_count: workers,
            open_retry_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(50),
            release_timeout,
        };
        let daemon = CacheDaemon::new(config, store).expect("daemon");
        let handle = daemon.shutdown_handle();
        let thread = thread::spawn(move || daemon.run());
        Self { handle, thread }
    }

    fn stop(self) {
        self.handle.shutdown();
        self.thread.join().expect("daemon thread").expect("daemon run");
    }
}

#[test]
fn concurrent_fetches_through_a_small_pool() {
    let prefix = unique_prefix("e2e");
    let store = Arc::new(MemoryStore::new());
    let files: Vec<(String, Vec<u8>)> = (0..6)
        .map(|i| (format!("/file{i}"), pattern(1000 + i * 3001, i as u8)))
        .collect();
    for (path, body) in &files {
        store.insert(path.clone(), body.clone());
    }

    let proxy = Arc::new(CacheProxy::start(proxy_config(&prefix, 2, 4096)).expect("proxy"));
    let daemon = RunningDaemon::start(proxy.channel_name(), store.clone(), 3);

    let clients: Vec<_> = files
        .iter()
        .cloned()
        .map(|(path, body)| {
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || {
                for _ in 0..3 {
                    let mut sink = MemorySink::new();
                    let delivered = proxy.fetch(&path, &mut sink).expect("fetch");
                    assert_eq!(delivered, Delivery::Complete { bytes: body.len() as u64 });
                    assert_eq!(sink.status(), Some(ResponseStatus::Ok));
                    assert_eq!(sink.body(), body.as_slice(), "{path}");
                }
            })
        })
        .collect();
    for client in clients {
        client.join().expect("client thread");
    }

    assert_eq!(proxy.pool().available(), 2);
    assert_eq!(proxy.segment_names().len(), 2);
    daemon.stop();
}

#[test]
fn daemon_started_first_waits_for_the_proxy() {
    let prefix = unique_prefix("early");
    let config = proxy_config(&prefix, 1, 512);
    let store = Arc::new(MemoryStore::new());
    store.insert("/early", b"waited for you".to_vec());

    let daemon = RunningDaemon::start(&config.channel_name, store.clone(), 1);
    thread::sleep(Duration::from_millis(100));
    let proxy = CacheProxy::start(config).expect("proxy");

    let mut sink = MemorySink::new();
    assert_eq!(
        proxy.fetch("/early", &mut sink).unwrap(),
        Delivery::Complete { bytes: 14 }
    );
    assert_eq!(sink.body(), b"waited for you");
    daemon.stop();
}

#[test]
fn missing_file_is_zero_bytes_through_the_handler() {
    let prefix = unique_prefix("missing");
    let store = Arc::new(MemoryStore::new());
    let proxy = CacheProxy::start(proxy_config(&prefix, 1, 4096)).expect("proxy");
    let daemon = RunningDaemon::start(proxy.channel_name(), store, 1);

    let mut sink = MemorySink::new();
    assert_eq!(proxy.handle("/nothing/here", &mut sink).unwrap(), 0);
    assert_eq!(sink.status(), Some(ResponseStatus::FileNotFound));
    assert!(sink.body().is_empty());
    daemon.stop();
}

#[test]
fn store_changes_are_visible_to_the_next_request() {
    let prefix = unique_prefix("live");
    let store = Arc::new(MemoryStore::new());
    let proxy = CacheProxy::start(proxy_config(&prefix, 1, 4096)).expect("proxy");
    let daemon = RunningDaemon::start(proxy.channel_name(), store.clone(), 2);

    let mut sink = MemorySink::new();
    assert_eq!(proxy.fetch("/late", &mut sink).unwrap(), Delivery::NotFound);

    store.insert("/late", b"now here".to_vec());
    let mut sink = MemorySink::new();
    assert_eq!(proxy.handle("/late", &mut sink).unwrap(), 8);

    assert!(store.remove("/late"));
    let mut sink = MemorySink::new();
    assert_eq!(proxy.fetch("/late", &mut sink).unwrap(), Delivery::NotFound);
    daemon.stop();
}

#[test]
fn fatal_hook_fires_once_and_slots_are_replaced() {
    let prefix = unique_prefix("fatal");
    let mut config = proxy_config(&prefix, 1, 256);
    config.ready_timeout = Some(Duration::from_millis(100));
    config.timeout_policy = TimeoutPolicy::Fatal;

    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);
    let proxy = CacheProxy::start(config)
        .expect("proxy")
        .with_fatal_hook(move |err| {
            assert!(err.is_timeout());
            seen.fetch_add(1, Ordering::SeqCst);
        });

    // No daemon: both requests time out.
    for _ in 0..2 {
        let mut sink = MemorySink::new();
        let err = proxy.fetch("/x", &mut sink).unwrap_err();
        assert!(matches!(err, Error::Timeout(t) if t == Duration::from_millis(100)));
        assert!(!sink.header_sent());
    }

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.pool().available(), 1);
    let names = proxy.segment_names();
    assert_eq!(
        names,
        vec![
            format!("/{prefix}_shm_0"),
            format!("/{prefix}_shm_0.1"),
            format!("/{prefix}_shm_0.2"),
        ]
    );
    // Retired segments are gone; the replacement is live.
    assert!(SharedSegment::attach(&names[0], 256).is_err());
    assert!(SharedSegment::attach(&names[1], 256).is_err());
    SharedSegment::attach(&names[2], 256).expect("replacement");
}

#[test]
fn fail_request_policy_recovers_once_the_daemon_arrives() {
    let prefix = unique_prefix("recover");
    let mut config = proxy_config(&prefix, 1, 1024);
    config.ready_timeout = Some(Duration::from_millis(100));
    let store = Arc::new(MemoryStore::new());
    store.insert("/doc", pattern(5000, 7));

    let proxy = CacheProxy::start(config).expect("proxy");
    let mut sink = MemorySink::new();
    assert!(proxy.fetch("/doc", &mut sink).unwrap_err().is_timeout());
    assert_eq!(proxy.pool().available(), 1);

    // The daemon first sees the stale request for the retired segment and
    // drops it; the next request goes to the replacement.
    let daemon = RunningDaemon::start(proxy.channel_name(), store, 1);
    let mut sink = MemorySink::new();
    assert_eq!(
        proxy.fetch("/doc", &mut sink).unwrap(),
        Delivery::Complete { bytes: 5000 }
    );
    assert_eq!(sink.body(), pattern(5000, 7).as_slice());
    daemon.stop();
}

#[test]
fn cleanup_removes_every_name() {
    let prefix = unique_prefix("cleanup");
    let proxy = CacheProxy::start(proxy_config(&prefix, 3, 128)).expect("proxy");
    let names = proxy.segment_names();
    let channel = proxy.channel_name().to_string();
    for name in &names {
        SharedSegment::attach(name, 128).expect("live segment");
    }

    proxy.cleanup();
    proxy.cleanup();
    for name in &names {
        assert!(SharedSegment::attach(name, 128).is_err(), "{name} survived");
    }
    let stop = AtomicBool::new(true);
    assert!(CommandChannel::open_reader(&channel, Duration::from_millis(1), &stop)
        .unwrap()
        .is_none());
}

#[test]
fn start_rejects_invalid_config() {
    let prefix = unique_prefix("invalid");
    let mut config = proxy_config(&prefix, 1, 128);
    config.segment_count = 0;
    assert!(matches!(CacheProxy::start(config), Err(Error::Config(_))));
}

#[test]
fn daemon_stops_while_waiting_for_the_channel() {
    let prefix = unique_prefix("absent");
    let channel_name = format!("/{prefix}_cmd");
    CommandChannel::unlink(&channel_name);
    let daemon = RunningDaemon::start(&channel_name, Arc::new(MemoryStore::new()), 1);
    thread::sleep(Duration::from_millis(50));
    daemon.stop();
}

/// Serves from `inner`, but takes `delay` to open `slow_path`.
struct SlowStore {
    inner: MemoryStore,
    slow_path: &'static str,
    delay: Duration,
}

impl ContentStore for SlowStore {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>> {
        if path == self.slow_path {
            thread::sleep(self.delay);
        }
        self.inner.open(path)
    }
}

#[test]
fn late_producer_does_not_wedge_the_daemon() {
    let prefix = unique_prefix("late");
    let mut config = proxy_config(&prefix, 1, 1024);
    config.ready_timeout = Some(Duration::from_millis(200));

    let inner = MemoryStore::new();
    inner.insert("/slow", pattern(3000, 1));
    inner.insert("/fast", pattern(3000, 2));
    let store = Arc::new(SlowStore {
        inner,
        slow_path: "/slow",
        delay: Duration::from_millis(400),
    });

    let proxy = CacheProxy::start(config).expect("proxy");
    // One worker, no release timeout: the daemon's defaults.
    let daemon = RunningDaemon::start_with(proxy.channel_name(), store, 1, None);

    let mut sink = MemorySink::new();
    assert!(proxy.fetch("/slow", &mut sink).unwrap_err().is_timeout());
    assert_eq!(proxy.segment_names().len(), 2);

    // The worker finishes opening the slow file, stages its header into the
    // retired segment, notices the retirement and takes the next request.
    thread::sleep(Duration::from_secs(1));
    for _ in 0..3 {
        let mut sink = MemorySink::new();
        assert_eq!(
            proxy.fetch("/fast", &mut sink).unwrap(),
            Delivery::Complete { bytes: 3000 }
        );
        assert_eq!(sink.body(), pattern(3000, 2).as_slice());
    }
    assert_eq!(proxy.pool().available(), 1);

    let start = Instant::now();
    daemon.stop();
    assert!(start.elapsed() < Duration::from_secs(2));
}
