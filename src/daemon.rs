// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cache daemon: one reader thread drains the command channel into a request
// queue; a fixed pool of workers runs the producer protocol for each `Get`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandChannel, Record};
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::handshake::{Handshake, SemaphorePair};
use crate::protocol::{self, FillOutcome};
use crate::segment::SharedSegment;
use crate::store::ContentStore;
use crate::work_queue::RequestQueue;

/// Stops a running [`CacheDaemon`] from another thread.
#[derive(Clone)]
pub struct DaemonShutdown {
    stop: Arc<AtomicBool>,
}

impl DaemonShutdown {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

pub struct CacheDaemon {
    config: DaemonConfig,
    store: Arc<dyn ContentStore>,
    stop: Arc<AtomicBool>,
}

impl CacheDaemon {
    pub fn new(config: DaemonConfig, store: Arc<dyn ContentStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> DaemonShutdown {
        DaemonShutdown {
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Serve requests until shut down.
    ///
    /// Waits for the proxy to create the channel first. Returns once the
    /// reader has stopped and every worker has finished its current fill.
    pub fn run(&self) -> Result<()> {
        let Some(channel) = CommandChannel::open_reader(
            &self.config.channel_name,
            self.config.open_retry_interval,
            &self.stop,
        )?
        else {
            info!("stopped before the command channel appeared");
            return Ok(());
        };
        info!(
            channel = channel.name(),
            workers = self.config.worker_count,
            "cache daemon serving"
        );

        let queue: Arc<RequestQueue<Record>> = Arc::new(RequestQueue::new());
        let mut workers = Vec::with_capacity(self.config.worker_count);
        for i in 0..self.config.worker_count {
            let worker_queue = Arc::clone(&queue);
            let store = Arc::clone(&self.store);
            let release_timeout = self.config.release_timeout;
            let spawned = thread::Builder::new()
                .name(format!("cache-worker-{i}"))
                .spawn(move || {
                    while let Some(record) = worker_queue.pop() {
                        // Outcomes are logged inside; nothing to report upward.
                        let _ = handle_request(&record, store.as_ref(), release_timeout);
                    }
                });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    queue.close();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e.into());
                }
            }
        }

        let result = self.receive_loop(&channel, &queue);

        queue.close();
        for worker in workers {
            if worker.join().is_err() {
                error!("cache worker panicked");
            }
        }
        info!("cache daemon stopped");
        result
    }

    fn receive_loop(&self, channel: &CommandChannel, queue: &RequestQueue<Record>) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            match channel.receive_timeout(self.config.poll_interval) {
                Ok(Some(record)) => match record.command() {
                    Command::Get => {
                        debug!(path = record.path(), segment = record.segment_name(), "request queued");
                        if queue.push(record).is_err() {
                            break;
                        }
                    }
                    Command::Sync | Command::Ack => debug!(command = ?record.command(), "ignoring rendezvous record"),
                },
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => warn!("dropping malformed record: {e}"),
                Err(e) => {
                    error!("command channel receive failed: {e}");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Serve one `Get` record: attach the named segment and fill it.
///
/// If the segment cannot be attached, the consumer is still answered through
/// the semaphore pair so that it fails the request instead of timing out.
pub fn handle_request(
    record: &Record,
    store: &dyn ContentStore,
    release_timeout: Option<Duration>,
) -> Result<FillOutcome> {
    let name = record.segment_name();
    let path = record.path();
    let attached = usize::try_from(record.segment_size())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "segment size overflows usize"))
        .and_then(|size| SharedSegment::attach(name, size));
    let mut segment = match attached {
        Ok(segment) => segment,
        Err(e) => {
            warn!(segment = name, path, "cannot attach segment: {e}");
            signal_attach_failure(name, release_timeout);
            return Err(e.into());
        }
    };
    // The proxy creates a slot's semaphores after its segment and unlinks
    // them after it, so a linked segment with no pair only happens when the
    // names were removed from outside. The consumer's timeout covers that.
    let handshake = match SemaphorePair::open(name) {
        Ok(pair) => pair,
        Err(e) => {
            if segment.is_linked().unwrap_or(true) {
                warn!(segment = name, path, "cannot open semaphores of a live segment: {e}");
                return Err(e.into());
            }
            debug!(segment = name, path, "segment retired before the fill started");
            return Err(Error::SegmentRetired(name.to_string()));
        }
    };

    let outcome = protocol::fill(&mut segment, &handshake, store, path, release_timeout);
    match &outcome {
        Ok(FillOutcome::Complete { bytes }) => debug!(path, bytes, "served"),
        Ok(FillOutcome::NotFound) => debug!(path, "not found"),
        Ok(FillOutcome::Cancelled) => info!(path, "proxy cancelled the transfer"),
        Err(Error::Timeout(t)) => warn!(path, segment = name, "proxy silent for {t:?}; abandoning"),
        Err(Error::SegmentRetired(_)) => {
            info!(path, segment = name, "proxy gave up on the transfer")
        }
        Err(e) => warn!(path, "fill failed: {e}"),
    }
    outcome
}

/// Upper bound on the release wait when answering an attach failure. The
/// consumer is idle at that point, so release is normally already posted.
const ATTACH_FAILURE_WAIT: Duration = Duration::from_secs(5);

/// Hand the turn back without touching the segment. The consumer sees the
/// untouched `Pending` status and fails the request.
fn signal_attach_failure(name: &str, release_timeout: Option<Duration>) {
    let pair = match SemaphorePair::open(name) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(segment = name, "cannot open semaphores either, dropping request: {e}");
            return;
        }
    };
    let wait = release_timeout.map_or(ATTACH_FAILURE_WAIT, |t| t.min(ATTACH_FAILURE_WAIT));
    match pair.wait_release(Some(wait)) {
        Ok(true) => {
            if let Err(e) = pair.signal_ready() {
                warn!(segment = name, "signal_ready: {e}");
            }
        }
        Ok(false) => warn!(segment = name, "proxy never released the segment"),
        Err(e) => warn!(segment = name, "wait_release: {e}"),
    }
}
