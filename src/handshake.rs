// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The ready/release semaphore pair that hands one segment back and forth
// between its consumer (proxy) and producer (daemon).
//
//   ready   = <segment>_reader, initial 0: header or chunk staged
//   release = <segment>_writer, initial 1: consumer done, producer may write

use std::io;
use std::time::Duration;

use crate::names;
use crate::semaphore::IpcSemaphore;

/// Turn-passing between the two sides of one segment.
///
/// Implemented by [`SemaphorePair`]; the protocol is generic over it so that
/// the signal sequence can be observed in tests.
pub trait Handshake {
    /// Wait for the producer's turn to end. `Ok(false)` on timeout.
    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<bool>;
    fn signal_ready(&self) -> io::Result<()>;
    /// Wait for the consumer's turn to end. `Ok(false)` on timeout.
    fn wait_release(&self, timeout: Option<Duration>) -> io::Result<bool>;
    fn signal_release(&self) -> io::Result<()>;
}

fn timeout_ms(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| t.as_millis().min(u64::MAX as u128) as u64)
}

/// The two named semaphores bound to one segment.
pub struct SemaphorePair {
    ready: IpcSemaphore,
    release: IpcSemaphore,
}

impl SemaphorePair {
    /// Create both semaphores for `segment` with their initial counts.
    /// Owner side only.
    pub fn create(segment: &str) -> io::Result<Self> {
        let ready = IpcSemaphore::create(&names::ready_sem_name(segment), 0)?;
        let release = IpcSemaphore::create(&names::release_sem_name(segment), 1)?;
        Ok(Self { ready, release })
    }

    /// Open the pair created by the owner of `segment`.
    pub fn open(segment: &str) -> io::Result<Self> {
        let ready = IpcSemaphore::open(&names::ready_sem_name(segment))?;
        let release = IpcSemaphore::open(&names::release_sem_name(segment))?;
        Ok(Self { ready, release })
    }

    /// Current `(ready, release)` counts.
    pub fn counts(&self) -> io::Result<(i32, i32)> {
        Ok((self.ready.value()?, self.release.value()?))
    }

    /// Remove both names.
    pub fn clear_storage(segment: &str) {
        IpcSemaphore::clear_storage(&names::ready_sem_name(segment));
        IpcSemaphore::clear_storage(&names::release_sem_name(segment));
    }
}

impl Handshake for SemaphorePair {
    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.ready.wait(timeout_ms(timeout))
    }

    fn signal_ready(&self) -> io::Result<()> {
        self.ready.post(1)
    }

    fn wait_release(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.release.wait(timeout_ms(timeout))
    }

    fn signal_release(&self) -> io::Result<()> {
        self.release.post(1)
    }
}

impl<H: Handshake + ?Sized> Handshake for &H {
    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).wait_ready(timeout)
    }

    fn signal_ready(&self) -> io::Result<()> {
        (**self).signal_ready()
    }

    fn wait_release(&self, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).wait_release(timeout)
    }

    fn signal_release(&self) -> io::Result<()> {
        (**self).signal_release()
    }
}
