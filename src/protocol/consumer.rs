// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proxy side of a transfer: publish the request, then forward each staged
// chunk to the client until the announced size has been sent.

use std::time::Duration;

use tracing::{debug, warn};

use crate::command::{CommandChannel, Record};
use crate::error::{Error, Result};
use crate::gateway::{ResponseSink, ResponseStatus};
use crate::handshake::Handshake;
use crate::protocol::Delivery;
use crate::segment::{SegmentStatus, SharedSegment};

/// Send deadline for the `Get` record when no ready timeout is configured.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(20);

fn await_ready<H: Handshake + ?Sized>(handshake: &H, timeout: Option<Duration>) -> Result<()> {
    if handshake.wait_ready(timeout)? {
        Ok(())
    } else {
        Err(Error::Timeout(timeout.unwrap_or_default()))
    }
}

/// Abandon the run while holding the turn.
///
/// The producer is told through the header, acknowledges with `ready`, and
/// the final `release` leaves the pair at its idle counts.
fn cancel<H: Handshake + ?Sized>(
    segment: &SharedSegment,
    handshake: &H,
    timeout: Option<Duration>,
) -> Result<()> {
    segment.set_status(SegmentStatus::Cancelled);
    handshake.signal_release()?;
    await_ready(handshake, timeout)?;
    handshake.signal_release()?;
    debug!(segment = segment.name(), "transfer cancelled");
    Ok(())
}

/// Fetch `path` through `segment` and stream it into `sink`.
///
/// `timeout` bounds every wait on the producer; `None` waits indefinitely.
/// On return every signal of the run has been issued, so the segment may
/// be reused, except after [`Error::Timeout`].
pub fn fetch<H, S>(
    channel: &CommandChannel,
    segment: &mut SharedSegment,
    handshake: &H,
    path: &str,
    sink: &mut S,
    timeout: Option<Duration>,
) -> Result<Delivery>
where
    H: Handshake + ?Sized,
    S: ResponseSink + ?Sized,
{
    let record = Record::get(path, segment.name(), segment.cache_size() as u64)?;
    segment.reset();
    channel.send_timeout(&record, timeout.unwrap_or(DEFAULT_SEND_TIMEOUT))?;

    await_ready(handshake, timeout)?;
    let file_size = segment.file_size();
    match segment.status() {
        SegmentStatus::NotFound => {
            handshake.signal_release()?;
            sink.send_header(ResponseStatus::FileNotFound, 0)?;
            debug!(path, "not in cache");
            return Ok(Delivery::NotFound);
        }
        SegmentStatus::Found => {}
        status => {
            handshake.signal_release()?;
            warn!(path, ?status, segment = segment.name(), "producer did not serve the request");
            sink.send_header(ResponseStatus::Error, 0)?;
            return Err(Error::ProducerFailed {
                path: path.to_string(),
            });
        }
    }

    if let Err(e) = sink.send_header(ResponseStatus::Ok, file_size) {
        cancel(segment, handshake, timeout)?;
        return Err(e.into());
    }
    handshake.signal_release()?;
    debug!(path, file_size, "header forwarded");

    let mut transferred: u64 = 0;
    while transferred < file_size {
        await_ready(handshake, timeout)?;
        if segment.status() == SegmentStatus::Error {
            handshake.signal_release()?;
            warn!(path, transferred, file_size, "producer failed mid-stream");
            return Err(Error::ProducerFailed {
                path: path.to_string(),
            });
        }

        let remaining = file_size - transferred;
        let chunk = match segment.chunk() {
            Ok(chunk) if !chunk.is_empty() && chunk.len() as u64 <= remaining => chunk,
            Ok(chunk) => {
                let len = chunk.len();
                cancel(segment, handshake, timeout)?;
                return Err(Error::Protocol(format!(
                    "staged chunk of {len} bytes with {remaining} bytes left"
                )));
            }
            Err(e) => {
                cancel(segment, handshake, timeout)?;
                return Err(Error::Protocol(e.to_string()));
            }
        };

        let expected = chunk.len();
        match sink.send_bytes(chunk) {
            Ok(written) if written == expected => {}
            Ok(written) => {
                cancel(segment, handshake, timeout)?;
                return Err(Error::ShortWrite { written, expected });
            }
            Err(e) => {
                cancel(segment, handshake, timeout)?;
                return Err(e.into());
            }
        }
        transferred += expected as u64;
        debug!(path, chunk = expected, transferred, "chunk forwarded");
        handshake.signal_release()?;
    }

    handshake.signal_release()?;
    Ok(Delivery::Complete { bytes: transferred })
}
