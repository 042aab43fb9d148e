// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Daemon side of a transfer: resolve the path, publish the header, then
// stage the file one data-area-sized chunk per turn.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::protocol::FillOutcome;
use crate::segment::{SegmentStatus, SharedSegment};
use crate::store::{ContentReader, ContentStore};

/// How often a waiting producer checks that its segment is still live.
const RETIRE_CHECK: Duration = Duration::from_millis(250);

/// Wait for the consumer's release.
///
/// A proxy that timed out retires the segment and never signals its
/// semaphores again, so the wait is sliced and gives up once the segment
/// name no longer refers to the mapped object.
fn await_release<H: Handshake + ?Sized>(
    segment: &SharedSegment,
    handshake: &H,
    timeout: Option<Duration>,
) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(RETIRE_CHECK),
            None => RETIRE_CHECK,
        };
        if handshake.wait_release(Some(slice))? {
            return Ok(());
        }
        if !segment.is_linked()? {
            return Err(Error::SegmentRetired(segment.name().to_string()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Timeout(timeout.unwrap_or_default()));
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_chunk(reader: &mut dyn ContentReader, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Publish `Error` and hand the turn back without waiting for it again.
fn fail<H: Handshake + ?Sized>(segment: &SharedSegment, handshake: &H) -> Result<()> {
    segment.set_status(SegmentStatus::Error);
    handshake.signal_ready()?;
    Ok(())
}

/// Stage the contents of `path` into `segment` for its consumer.
///
/// `release_timeout` bounds each wait for the consumer; `None` waits for as
/// long as the segment stays linked. Returns [`Error::SegmentRetired`] if the
/// proxy unlinks it mid-run.
pub fn fill<H: Handshake + ?Sized>(
    segment: &mut SharedSegment,
    handshake: &H,
    store: &dyn ContentStore,
    path: &str,
    release_timeout: Option<Duration>,
) -> Result<FillOutcome> {
    await_release(segment, handshake, release_timeout)?;
    segment.reset();

    let mut reader = match store.open(path) {
        Ok(Some(reader)) => reader,
        Ok(None) => {
            segment.set_status(SegmentStatus::NotFound);
            handshake.signal_ready()?;
            debug!(path, "not in cache");
            return Ok(FillOutcome::NotFound);
        }
        Err(e) => {
            fail(segment, handshake)?;
            return Err(e.into());
        }
    };

    let file_size = reader.size();
    segment.set_file_size(file_size);
    segment.set_status(SegmentStatus::Found);
    handshake.signal_ready()?;
    await_release(segment, handshake, release_timeout)?;
    if segment.status() == SegmentStatus::Cancelled {
        handshake.signal_ready()?;
        debug!(path, "cancelled after header");
        return Ok(FillOutcome::Cancelled);
    }

    let mut staged: u64 = 0;
    while staged < file_size {
        let want = (file_size - staged).min(segment.cache_size() as u64) as usize;
        let got = match read_chunk(reader.as_mut(), &mut segment.data_mut()[..want]) {
            Ok(0) => {
                warn!(path, staged, file_size, "content ended early");
                fail(segment, handshake)?;
                return Err(Error::ProducerFailed {
                    path: path.to_string(),
                });
            }
            Ok(n) => n,
            Err(e) => {
                warn!(path, staged, "read failed: {e}");
                fail(segment, handshake)?;
                return Err(Error::ProducerFailed {
                    path: path.to_string(),
                });
            }
        };

        segment.set_chunk_size(got);
        handshake.signal_ready()?;
        await_release(segment, handshake, release_timeout)?;
        if segment.status() == SegmentStatus::Cancelled {
            handshake.signal_ready()?;
            debug!(path, staged, "cancelled mid-stream");
            return Ok(FillOutcome::Cancelled);
        }
        staged += got as u64;
    }

    debug!(path, bytes = staged, "fill complete");
    Ok(FillOutcome::Complete { bytes: staged })
}
