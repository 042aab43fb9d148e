// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Data segment shared between one proxy worker and one daemon worker.
//
// Layout of the user region:
//
//   [ SegmentHeader (32 bytes) ]
//   [ cache_size data bytes    ]
//
// Header fields are written only by the side currently holding the turn
// (see `handshake`). They are atomics so that the hand-over through the
// semaphores is the only ordering either side relies on.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::shm::{ShmHandle, ShmOpenMode};

#[repr(C)]
struct SegmentHeader {
    status: AtomicU32,
    _reserved: u32,
    file_size: AtomicU64,
    cache_size: AtomicU64,
    chunk_size: AtomicU64,
}

/// Bytes in front of the data area.
pub const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

const _: () = assert!(HEADER_SIZE == 32);

/// Outcome of the most recent fill, as published in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentStatus {
    NotFound = 0,
    Found = 1,
    Error = 2,
    /// Request published, producer has not answered yet.
    Pending = 3,
    /// Consumer abandoned the run; producer must stop staging.
    Cancelled = 4,
}

impl SegmentStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => SegmentStatus::NotFound,
            1 => SegmentStatus::Found,
            3 => SegmentStatus::Pending,
            4 => SegmentStatus::Cancelled,
            _ => SegmentStatus::Error,
        }
    }
}

/// Typed view over a mapped data segment.
pub struct SharedSegment {
    shm: ShmHandle,
    name: String,
    cache_size: usize,
}

impl SharedSegment {
    /// Create the segment `name` with a data area of `cache_size` bytes.
    /// Any stale object of the same name is unlinked first.
    pub fn create(name: &str, cache_size: usize) -> io::Result<Self> {
        if cache_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cache size is 0"));
        }
        ShmHandle::unlink_by_name(name);
        let shm = ShmHandle::acquire(name, HEADER_SIZE + cache_size, ShmOpenMode::Create)?;
        let segment = Self {
            name: shm.name().to_string(),
            shm,
            cache_size,
        };
        segment
            .header()
            .cache_size
            .store(cache_size as u64, Ordering::Release);
        segment.reset();
        Ok(segment)
    }

    /// Attach to a segment created by the proxy.
    ///
    /// Fails if the object does not exist, was not created for
    /// `HEADER_SIZE + cache_size` bytes, or advertises a different data size.
    pub fn attach(name: &str, cache_size: usize) -> io::Result<Self> {
        if cache_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cache size is 0"));
        }
        let shm = ShmHandle::acquire(name, HEADER_SIZE + cache_size, ShmOpenMode::Open)?;
        let segment = Self {
            name: shm.name().to_string(),
            shm,
            cache_size,
        };
        let advertised = segment.header().cache_size.load(Ordering::Acquire);
        if advertised != cache_size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment {} advertises {advertised} data bytes, request says {cache_size}",
                    segment.name
                ),
            ));
        }
        Ok(segment)
    }

    fn header(&self) -> &SegmentHeader {
        // mmap returns page-aligned memory and the region is at least HEADER_SIZE.
        unsafe { &*(self.shm.as_ptr() as *const SegmentHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_mut_ptr().add(HEADER_SIZE) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity of the data area.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn status(&self) -> SegmentStatus {
        SegmentStatus::from_raw(self.header().status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SegmentStatus) {
        self.header().status.store(status as u32, Ordering::Release);
    }

    pub fn file_size(&self) -> u64 {
        self.header().file_size.load(Ordering::Acquire)
    }

    pub fn set_file_size(&self, size: u64) {
        self.header().file_size.store(size, Ordering::Release);
    }

    pub fn chunk_size(&self) -> u64 {
        self.header().chunk_size.load(Ordering::Acquire)
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.header().chunk_size.store(size as u64, Ordering::Release);
    }

    /// Clear per-request state: `Pending`, no file, no staged bytes.
    pub fn reset(&self) {
        let h = self.header();
        h.file_size.store(0, Ordering::Relaxed);
        h.chunk_size.store(0, Ordering::Relaxed);
        h.status.store(SegmentStatus::Pending as u32, Ordering::Release);
    }

    /// The bytes currently staged by the producer.
    ///
    /// Fails if the header claims more bytes than the data area holds.
    pub fn chunk(&self) -> io::Result<&[u8]> {
        let n = self.chunk_size();
        if n > self.cache_size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk of {n} bytes exceeds the {}-byte data area", self.cache_size),
            ));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.data_ptr(), n as usize) })
    }

    /// The whole data area, for the producer to stage into.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.cache_size) }
    }

    /// Number of live mappings (proxy + attached daemon workers).
    pub fn ref_count(&self) -> i32 {
        self.shm.ref_count()
    }

    /// `false` once the proxy has unlinked this segment, for example after
    /// retiring it on a timeout or during cleanup.
    pub fn is_linked(&self) -> io::Result<bool> {
        self.shm.is_linked()
    }

    /// Remove the name. Mappings stay valid until dropped.
    pub fn unlink(&self) {
        self.shm.unlink();
    }

    pub fn unlink_by_name(name: &str) {
        ShmHandle::unlink_by_name(name);
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("cache_size", &self.cache_size)
            .field("status", &self.status())
            .finish()
    }
}
