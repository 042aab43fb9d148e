// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control plane: a named, bounded POSIX message queue carrying fixed-size
// request records from the proxy to the cache daemon.
//
// Record layout (native endian, RECORD_SIZE bytes):
//
//   offset  0  u32        command (Sync = 0, Ack = 1, Get = 2)
//   offset  4  u32        reserved, zero
//   offset  8  u64        segment_size (data area bytes)
//   offset 16  [u8; 64]   segment_name, NUL-terminated
//   offset 80  [u8; 128]  path, NUL-terminated

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::names;
use crate::platform::PlatformMsgQueue;

/// Size of one wire record.
pub const RECORD_SIZE: usize = 208;

/// Records the channel holds before senders block.
pub const CHANNEL_CAPACITY: usize = 8;

const OFF_COMMAND: usize = 0;
const OFF_SIZE: usize = 8;
const OFF_NAME: usize = 16;
const OFF_PATH: usize = 80;
const NAME_FIELD: usize = names::SEGMENT_NAME_MAX + 1;
const PATH_FIELD: usize = names::PATH_MAX + 1;

const _: () = assert!(OFF_NAME + NAME_FIELD == OFF_PATH);
const _: () = assert!(OFF_PATH + PATH_FIELD == RECORD_SIZE);

/// How long the writer's handshake may wait for room in the channel.
const HANDSHAKE_SEND_MS: u64 = 1000;

/// Slice used while polling for the stop flag in blocking reader calls.
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Writer-side rendezvous sent right after opening the channel.
    Sync,
    /// Reserved rendezvous reply; ignored by the daemon.
    Ack,
    /// Fill the named segment with the contents of a path.
    Get,
}

impl Command {
    fn to_raw(self) -> u32 {
        match self {
            Command::Sync => 0,
            Command::Ack => 1,
            Command::Get => 2,
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Command::Sync),
            1 => Some(Command::Ack),
            2 => Some(Command::Get),
            _ => None,
        }
    }
}

/// One command channel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    command: Command,
    segment_name: String,
    segment_size: u64,
    path: String,
}

fn check_field(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(Error::NameTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(Error::Protocol(format!("{field} contains a NUL byte")));
    }
    Ok(())
}

fn read_cstr(field: &'static str, bytes: &[u8]) -> io::Result<String> {
    let end = bytes.iter().position(|&b| b == 0).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("{field} is not NUL-terminated"))
    })?;
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("{field} is not UTF-8")))
}

impl Record {
    pub fn sync() -> Self {
        Self {
            command: Command::Sync,
            segment_name: String::new(),
            segment_size: 0,
            path: String::new(),
        }
    }

    pub fn ack() -> Self {
        Self {
            command: Command::Ack,
            ..Self::sync()
        }
    }

    /// A fill request for `path` into `segment_name`.
    pub fn get(path: &str, segment_name: &str, segment_size: u64) -> Result<Self> {
        check_field("path", path, names::PATH_MAX)?;
        check_field("segment name", segment_name, names::SEGMENT_NAME_MAX)?;
        Ok(Self {
            command: Command::Get,
            segment_name: segment_name.to_string(),
            segment_size,
            path: path.to_string(),
        })
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[OFF_COMMAND..OFF_COMMAND + 4].copy_from_slice(&self.command.to_raw().to_ne_bytes());
        buf[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&self.segment_size.to_ne_bytes());
        // Lengths were checked at construction; the field tail stays NUL.
        let name = self.segment_name.as_bytes();
        buf[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name);
        let path = self.path.as_bytes();
        buf[OFF_PATH..OFF_PATH + path.len()].copy_from_slice(path);
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() != RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record is {} bytes, expected {RECORD_SIZE}", buf.len()),
            ));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[OFF_COMMAND..OFF_COMMAND + 4]);
        let raw = u32::from_ne_bytes(raw);
        let command = Command::from_raw(raw).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown command {raw}"))
        })?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[OFF_SIZE..OFF_SIZE + 8]);
        Ok(Self {
            command,
            segment_size: u64::from_ne_bytes(size),
            segment_name: read_cstr("segment name", &buf[OFF_NAME..OFF_NAME + NAME_FIELD])?,
            path: read_cstr("path", &buf[OFF_PATH..OFF_PATH + PATH_FIELD])?,
        })
    }
}

/// Bounded FIFO of [`Record`]s shared by the proxy (writer) and the daemon
/// (reader).
pub struct CommandChannel {
    queue: PlatformMsgQueue,
    // A Get that arrived in place of the reader's handshake.
    pending: Mutex<Option<Record>>,
}

impl CommandChannel {
    /// Create or open the channel and announce the writer with a `Sync`.
    pub fn open_writer(name: &str) -> io::Result<Self> {
        let queue = PlatformMsgQueue::create_or_open(name, CHANNEL_CAPACITY, RECORD_SIZE)?;
        if !queue.send(&Record::sync().encode(), Some(HANDSHAKE_SEND_MS))? {
            warn!(channel = queue.name(), "command channel full at startup; is the cache daemon running?");
        }
        debug!(channel = queue.name(), "command channel writer ready");
        Ok(Self {
            queue,
            pending: Mutex::new(None),
        })
    }

    /// Open the channel as the reader and consume the writer's handshake.
    ///
    /// Retries every `retry_interval` until the proxy has created the
    /// channel. Returns `Ok(None)` if `stop` is raised first. If a `Get`
    /// shows up instead of the handshake (the proxy started before this
    /// reader), it is kept for the next receive.
    pub fn open_reader(
        name: &str,
        retry_interval: Duration,
        stop: &AtomicBool,
    ) -> io::Result<Option<Self>> {
        let queue = loop {
            match PlatformMsgQueue::open(name, RECORD_SIZE) {
                Ok(q) => break q,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(channel = name, "command channel not there yet; retrying");
                    if !sleep_unless_stopped(retry_interval, stop) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        let channel = Self {
            queue,
            pending: Mutex::new(None),
        };

        let first = loop {
            if stop.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(record) = channel.receive_timeout(STOP_POLL)? {
                break record;
            }
        };
        match first.command() {
            Command::Get => {
                debug!(channel = name, "handshake skipped; proxy was already running");
                *channel.pending.lock().unwrap() = Some(first);
            }
            Command::Sync | Command::Ack => {
                debug!(channel = name, "command channel handshake received");
            }
        }
        Ok(Some(channel))
    }

    /// Send, blocking while the channel is full.
    pub fn send(&self, record: &Record) -> io::Result<()> {
        self.queue.send(&record.encode(), None)?;
        Ok(())
    }

    /// Send, failing with [`Error::ChannelFull`] if no slot frees up in time.
    pub fn send_timeout(&self, record: &Record, timeout: Duration) -> Result<()> {
        let ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        if self.queue.send(&record.encode(), Some(ms))? {
            Ok(())
        } else {
            Err(Error::ChannelFull(timeout))
        }
    }

    /// Block until a record arrives.
    pub fn receive(&self) -> io::Result<Record> {
        if let Some(record) = self.pending.lock().unwrap().take() {
            return Ok(record);
        }
        let mut buf = [0u8; RECORD_SIZE];
        // `None` only comes back from timed receives.
        let n = self.queue.receive(&mut buf, None)?.unwrap_or(0);
        Record::decode(&buf[..n])
    }

    /// Wait up to `timeout` for a record.
    pub fn receive_timeout(&self, timeout: Duration) -> io::Result<Option<Record>> {
        if let Some(record) = self.pending.lock().unwrap().take() {
            return Ok(Some(record));
        }
        let mut buf = [0u8; RECORD_SIZE];
        let ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        match self.queue.receive(&mut buf, Some(ms))? {
            Some(n) => Record::decode(&buf[..n]).map(Some),
            None => Ok(None),
        }
    }

    /// Records currently queued.
    pub fn len(&self) -> io::Result<usize> {
        self.queue.len()
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Remove the channel name. Safe to call if it is already gone.
    pub fn unlink(name: &str) {
        PlatformMsgQueue::unlink_by_name(name);
    }
}

/// Sleep for `total` in short slices. Returns `false` if `stop` was raised.
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let step = left.min(STOP_POLL);
        thread::sleep(step);
        left -= step;
    }
    !stop.load(Ordering::Acquire)
}
