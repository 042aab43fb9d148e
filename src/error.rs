// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

//! Error type shared by the proxy, the daemon and the streaming protocol.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised above the platform layer.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from a POSIX primitive, the content store or the client socket.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A name or path does not fit its fixed-size record field.
    #[error("{field} is {len} bytes, limit is {max}")]
    NameTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// The peer did not signal within the configured window.
    #[error("no signal from the cache daemon within {0:?}")]
    Timeout(Duration),

    /// The command channel stayed full for the whole send window.
    #[error("command channel full for {0:?}")]
    ChannelFull(Duration),

    /// The producer reported a failure through the segment header.
    #[error("cache daemon failed to serve {path}")]
    ProducerFailed { path: String },

    /// The proxy unlinked the segment while a fill was waiting on it.
    #[error("segment {0} was retired by the proxy")]
    SegmentRetired(String),

    /// The network layer accepted fewer bytes than were staged.
    #[error("short write to client: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// The peer broke the segment protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The content store could not be loaded.
    #[error("content store error: {0}")]
    Store(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error was caused by an unresponsive peer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
