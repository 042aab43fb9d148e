// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Proxy-side free list of data segments. The pool size bounds how many
// shared-memory transfers run at once.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::handshake::SemaphorePair;
use crate::names;
use crate::segment::SharedSegment;

/// One pool entry: a segment plus the semaphore pair guarding it.
///
/// Not `Clone`: whoever holds the slot owns the segment's turn, and
/// returning it to the pool moves it.
pub struct Slot {
    index: usize,
    generation: u32,
    segment: SharedSegment,
    handshake: SemaphorePair,
}

impl Slot {
    /// Create the segment and semaphores for pool position `index`.
    pub fn create(prefix: &str, index: usize, generation: u32, cache_size: usize) -> io::Result<Self> {
        let name = names::segment_name(prefix, index, generation);
        let segment = SharedSegment::create(&name, cache_size)?;
        let handshake = match SemaphorePair::create(segment.name()) {
            Ok(h) => h,
            Err(e) => {
                segment.unlink();
                return Err(e);
            }
        };
        Ok(Self {
            index,
            generation,
            segment,
            handshake,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    pub fn handshake(&self) -> &SemaphorePair {
        &self.handshake
    }

    /// Split borrow for a protocol run.
    pub fn parts_mut(&mut self) -> (&mut SharedSegment, &SemaphorePair) {
        (&mut self.segment, &self.handshake)
    }

    /// Remove the segment and semaphore names.
    pub fn unlink(&self) {
        self.segment.unlink();
        SemaphorePair::clear_storage(self.segment.name());
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("name", &self.segment.name())
            .finish()
    }
}

/// Thread-safe free list of [`Slot`]s.
pub struct SegmentPool {
    free: Mutex<VecDeque<Slot>>,
    available: Condvar,
    capacity: usize,
}

impl SegmentPool {
    pub fn new(slots: Vec<Slot>) -> Self {
        let capacity = slots.len();
        Self {
            free: Mutex::new(slots.into()),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Create `count` slots named `/<prefix>_shm_<i>` with `cache_size`
    /// data bytes each.
    pub fn create(prefix: &str, count: usize, cache_size: usize) -> io::Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            match Slot::create(prefix, index, 0, cache_size) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.unlink();
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::new(slots))
    }

    /// Take a slot, blocking until one is free.
    pub fn acquire(&self) -> Slot {
        let mut free = self.free.lock().unwrap();
        loop {
            if let Some(slot) = free.pop_front() {
                return slot;
            }
            free = self.available.wait(free).unwrap();
        }
    }

    /// Take a slot, giving up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Slot> {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock().unwrap();
        loop {
            if let Some(slot) = free.pop_front() {
                return Some(slot);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            free = self.available.wait_timeout(free, deadline - now).unwrap().0;
        }
    }

    pub fn try_acquire(&self) -> Option<Slot> {
        self.free.lock().unwrap().pop_front()
    }

    /// Return a slot and wake one waiter.
    pub fn release(&self, slot: Slot) {
        self.free.lock().unwrap().push_back(slot);
        self.available.notify_one();
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Slots the pool was built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove every free slot (shutdown).
    pub fn drain(&self) -> Vec<Slot> {
        self.free.lock().unwrap().drain(..).collect()
    }
}
