// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proxy side: owns the command channel writer and the segment pool, and
// serves each client request by running the consumer protocol on a pooled
// segment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::command::CommandChannel;
use crate::config::{ProxyConfig, TimeoutPolicy, SERVER_FAILURE};
use crate::error::{Error, Result};
use crate::gateway::{RequestHandler, ResponseSink};
use crate::handshake::SemaphorePair;
use crate::names;
use crate::pool::{SegmentPool, Slot};
use crate::protocol::{self, Delivery};
use crate::segment::SharedSegment;

/// Called when the daemon misses a ready deadline under
/// [`TimeoutPolicy::Fatal`].
pub type FatalHook = Box<dyn Fn(&Error) + Send + Sync>;

pub struct CacheProxy {
    config: ProxyConfig,
    channel: CommandChannel,
    pool: SegmentPool,
    // Every segment name this proxy ever created, for cleanup.
    created: Mutex<Vec<String>>,
    // Next replacement generation per pool index.
    generations: Mutex<Vec<u32>>,
    fatal_hook: Option<FatalHook>,
    fatal_fired: AtomicBool,
    cleaned: AtomicBool,
}

impl CacheProxy {
    /// Create the segment pool and open the command channel as its writer.
    pub fn start(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let pool = SegmentPool::create(
            &config.segment_prefix,
            config.segment_count,
            config.segment_size,
        )?;
        let created: Vec<String> = (0..config.segment_count)
            .map(|i| names::segment_name(&config.segment_prefix, i, 0))
            .collect();

        let channel = match CommandChannel::open_writer(&config.channel_name) {
            Ok(c) => c,
            Err(e) => {
                for slot in pool.drain() {
                    slot.unlink();
                }
                return Err(e.into());
            }
        };
        info!(
            channel = %config.channel_name,
            segments = config.segment_count,
            segment_size = config.segment_size,
            "proxy ready"
        );

        Ok(Self {
            generations: Mutex::new(vec![1; config.segment_count]),
            config,
            channel,
            pool,
            created: Mutex::new(created),
            fatal_hook: None,
            fatal_fired: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        })
    }

    /// Replace the default fatal action (log, clean up, exit with
    /// [`SERVER_FAILURE`]).
    pub fn with_fatal_hook(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.fatal_hook = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Names of every segment created so far, retired ones included.
    pub fn segment_names(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Run one request on a pooled segment.
    pub fn fetch(&self, path: &str, sink: &mut dyn ResponseSink) -> Result<Delivery> {
        let mut slot = self.pool.acquire();
        let result = {
            let (segment, handshake) = slot.parts_mut();
            protocol::fetch(
                &self.channel,
                segment,
                handshake,
                path,
                sink,
                self.config.ready_timeout,
            )
        };
        match &result {
            Err(e) if e.is_timeout() => self.on_timeout(slot, e),
            _ => self.pool.release(slot),
        }
        result
    }

    /// A slot whose run timed out has unknown semaphore state: retire it and
    /// put a fresh segment under a new name in its place.
    fn on_timeout(&self, slot: Slot, err: &Error) {
        if self.config.timeout_policy == TimeoutPolicy::Fatal
            && !self.fatal_fired.swap(true, Ordering::AcqRel)
        {
            match &self.fatal_hook {
                Some(hook) => hook(err),
                None => {
                    error!(segment = slot.name(), "{err}; shutting down");
                    self.cleanup();
                    std::process::exit(SERVER_FAILURE);
                }
            }
        }

        let index = slot.index();
        warn!(segment = slot.name(), "{err}; retiring segment");
        slot.unlink();
        drop(slot);

        let generation = {
            let mut generations = self.generations.lock().unwrap();
            let g = generations[index];
            generations[index] = g.wrapping_add(1).max(1);
            g
        };
        match Slot::create(
            &self.config.segment_prefix,
            index,
            generation,
            self.config.segment_size,
        ) {
            Ok(fresh) => {
                self.created.lock().unwrap().push(fresh.name().to_string());
                self.pool.release(fresh);
            }
            Err(e) => error!(index, "could not replace retired segment: {e}"),
        }
    }

    /// Remove the channel and every segment and semaphore name this proxy
    /// created. Runs once; later calls do nothing.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        CommandChannel::unlink(&self.config.channel_name);
        for name in self.created.lock().unwrap().iter() {
            SharedSegment::unlink_by_name(name);
            SemaphorePair::clear_storage(name);
        }
        info!(channel = %self.config.channel_name, "proxy IPC names removed");
    }
}

impl RequestHandler for CacheProxy {
    fn handle(&self, path: &str, sink: &mut dyn ResponseSink) -> Result<u64> {
        match self.fetch(path, sink)? {
            Delivery::NotFound => Ok(0),
            Delivery::Complete { bytes } => Ok(bytes),
        }
    }
}

impl Drop for CacheProxy {
    fn drop(&mut self) {
        self.cleanup();
    }
}
