// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

//! Runtime settings for the proxy and the cache daemon.

use std::time::Duration;

use clap::ValueEnum;

use crate::error::{Error, Result};
use crate::names;

/// Exit status used when the proxy gives up on an unresponsive daemon.
pub const SERVER_FAILURE: i32 = 255;

pub const DEFAULT_PORT: u16 = 51418;
pub const MAX_PROXY_WORKERS: usize = 1024;
pub const MAX_DAEMON_WORKERS: usize = 31415;

/// What the proxy does when the daemon misses a ready deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TimeoutPolicy {
    /// Run the fatal hook (by default: log and exit with [`SERVER_FAILURE`]).
    #[default]
    Fatal,
    /// Fail the request and replace the segment it was using.
    FailRequest,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub worker_count: usize,
    pub segment_count: usize,
    pub segment_size: usize,
    pub segment_prefix: String,
    pub channel_name: String,
    /// `None` waits forever.
    pub ready_timeout: Option<Duration>,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            worker_count: 1,
            segment_count: 4,
            segment_size: 4096,
            segment_prefix: names::DEFAULT_SEGMENT_PREFIX.to_string(),
            channel_name: names::CMD_CHANNEL.to_string(),
            ready_timeout: Some(Duration::from_secs(20)),
            timeout_policy: TimeoutPolicy::Fatal,
        }
    }
}

fn check_channel_name(name: &str) -> Result<()> {
    if name.len() < 2 || !name.starts_with('/') || name[1..].contains('/') {
        return Err(Error::Config(format!(
            "channel name {name:?} must be `/` followed by a name without slashes"
        )));
    }
    Ok(())
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_port < 1024 {
            return Err(Error::Config(format!(
                "listen port {} is below 1024",
                self.listen_port
            )));
        }
        if !(1..=MAX_PROXY_WORKERS).contains(&self.worker_count) {
            return Err(Error::Config(format!(
                "worker count {} outside 1..={MAX_PROXY_WORKERS}",
                self.worker_count
            )));
        }
        if self.segment_count == 0 {
            return Err(Error::Config("segment count must be at least 1".into()));
        }
        if self.segment_size == 0 {
            return Err(Error::Config("segment size must be at least 1".into()));
        }
        if self.segment_prefix.is_empty() || self.segment_prefix.contains('/') {
            return Err(Error::Config(format!(
                "segment prefix {:?} must be non-empty and free of slashes",
                self.segment_prefix
            )));
        }
        // The longest name a replacement slot can get must still fit a record.
        let longest = names::segment_name(&self.segment_prefix, self.segment_count - 1, u32::MAX);
        if longest.len() > names::SEGMENT_NAME_MAX {
            return Err(Error::NameTooLong {
                field: "segment name",
                len: longest.len(),
                max: names::SEGMENT_NAME_MAX,
            });
        }
        check_channel_name(&self.channel_name)?;
        if self.ready_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("ready timeout must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub channel_name: String,
    pub worker_count: usize,
    /// Delay between attempts to open a channel the proxy has not created yet.
    pub open_retry_interval: Duration,
    /// How often the reader wakes to check for shutdown.
    pub poll_interval: Duration,
    /// Bound on each wait for the proxy during a fill. `None` waits for as
    /// long as the segment stays linked.
    pub release_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            channel_name: names::CMD_CHANNEL.to_string(),
            worker_count: 3,
            open_retry_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            release_timeout: None,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_DAEMON_WORKERS).contains(&self.worker_count) {
            return Err(Error::Config(format!(
                "worker count {} outside 1..={MAX_DAEMON_WORKERS}",
                self.worker_count
            )));
        }
        check_channel_name(&self.channel_name)?;
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".into()));
        }
        Ok(())
    }
}
