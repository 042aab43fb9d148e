// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process counting semaphore.
// Delegates to platform::PlatformSemaphore (sem_open).

use std::io;

use crate::platform::PlatformSemaphore;

/// A named, inter-process counting semaphore.
///
/// The owner creates it with [`IpcSemaphore::create`]; peers attach with
/// [`IpcSemaphore::open`], which never creates.
pub struct IpcSemaphore {
    inner: PlatformSemaphore,
}

impl IpcSemaphore {
    /// Create a fresh semaphore with `initial` count.
    ///
    /// A stale object left behind under `name` is unlinked first, so the
    /// initial count is always the one requested.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        PlatformSemaphore::unlink_by_name(name);
        let inner = PlatformSemaphore::create(name, initial)?;
        Ok(Self { inner })
    }

    /// Open a semaphore somebody else created.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = PlatformSemaphore::open(name)?;
        Ok(Self { inner })
    }

    /// Wait for the count to become positive and decrement it.
    /// If `timeout_ms` is `None`, blocks indefinitely.
    /// Returns `Ok(true)` if acquired, `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.inner.wait(timeout_ms)
    }

    /// Decrement without blocking. Returns `Ok(false)` if the count is zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        self.inner.try_wait()
    }

    /// Increment the count by `count`, waking up to that many waiters.
    pub fn post(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            self.inner.post()?;
        }
        Ok(())
    }

    /// Current count.
    pub fn value(&self) -> io::Result<i32> {
        self.inner.value()
    }

    /// The POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Remove the name. Open handles keep working.
    pub fn clear_storage(name: &str) {
        PlatformSemaphore::unlink_by_name(name);
    }
}
