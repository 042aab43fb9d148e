// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

//! Chunked transfer of one file through one data segment.
//!
//! The consumer (proxy) and producer (daemon) take turns on the segment via
//! its [`Handshake`](crate::handshake::Handshake): the producer stages a
//! header or a chunk and signals `ready`; the consumer forwards it and
//! signals `release`. Both sides stop once `file_size` bytes have moved.

pub mod consumer;
pub mod producer;

pub use consumer::fetch;
pub use producer::fill;

/// How a consumer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    NotFound,
    Complete { bytes: u64 },
}

/// How a producer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    NotFound,
    Complete { bytes: u64 },
    /// The consumer abandoned the transfer.
    Cancelled,
}
