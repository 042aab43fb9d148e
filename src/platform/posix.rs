// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the IPC primitives used by the proxy and the
// cache daemon: shared memory segments (shm_open + mmap), named counting
// semaphores (sem_open) and message queues (mq_open).

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::names;

/// Permissions for every named object we create (rw for user, group, other).
const PERMS: libc::mode_t = 0o666;

fn c_name(posix_name: &str) -> io::Result<CString> {
    CString::new(posix_name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Absolute CLOCK_REALTIME deadline `timeout_ms` from now, as required by
/// `sem_timedwait`, `mq_timedsend` and `mq_timedreceive`.
fn deadline_after(timeout_ms: u64) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let ns_total = ts.tv_nsec as u64 + (timeout_ms % 1000) * 1_000_000;
    ts.tv_sec += (timeout_ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
    ts
}

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

/// Rounds the user size up to the counter alignment, then appends an
/// `AtomicI32` reference counter shared by every process mapping the segment.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Returns a reference to the trailing `AtomicI32` ref-counter inside a mapped
/// region of `total_size` bytes starting at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm: POSIX shared memory
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter)
    user_size: usize, // user-requested size
    name: String,     // POSIX name (with leading '/')
    // Identity of the mapped object, to tell whether the name still refers to it.
    dev: libc::dev_t,
    ino: libc::ino_t,
}

// Safety: the shared memory region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

/// Open mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = names::posix_name(name);
        let c_name = c_name(&posix_name)?;
        let total_size = calc_size(user_size);

        let fd = match mode {
            ShmMode::Create => unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    PERMS as libc::c_uint,
                )
            },
            ShmMode::Open => unsafe {
                libc::shm_open(c_name.as_ptr(), libc::O_RDWR, PERMS as libc::c_uint)
            },
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        match mode {
            ShmMode::Create => {
                // Umask may have stripped group/other bits.
                unsafe { libc::fchmod(fd, PERMS) };
                let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
                if ret != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
            }
            ShmMode::Open => {
                // The ref counter lives at the end of the object, so the
                // requested size must match the creator's exactly.
                if st.st_size as u64 != total_size as u64 {
                    unsafe { libc::close(fd) };
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "shm object {posix_name} holds {} bytes, {total_size} requested",
                            st.st_size
                        ),
                    ));
                }
            }
        }

        Self::mmap_and_finish(fd, total_size, user_size, posix_name, &st)
    }

    fn mmap_and_finish(
        fd: i32,
        total_size: usize,
        user_size: usize,
        posix_name: String,
        st: &libc::stat,
    ) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
            dev: st.st_dev,
            ino: st.st_ino,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live mappings across all processes.
    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Whether the name still refers to this mapping's object. `false` once
    /// it was unlinked, or unlinked and created again by someone else.
    pub fn is_linked(&self) -> io::Result<bool> {
        let c_name = c_name(&self.name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT) => Ok(false),
                _ => Err(err),
            };
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut st) };
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        if ret != 0 {
            return Err(err);
        }
        Ok(st.st_dev == self.dev && st.st_ino == self.ino)
    }

    /// Remove the name (shm_unlink). Existing mappings stay valid.
    pub fn unlink(&self) {
        if let Ok(c_name) = c_name(&self.name) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = c_name(&names::posix_name(name)) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // Last mapping out removes the name, unless it now belongs to a newer object.
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 && self.is_linked().unwrap_or(false) {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSemaphore: POSIX named counting semaphore
// ---------------------------------------------------------------------------

pub struct PlatformSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// Safety: sem_t operations are thread-safe; the handle is only closed on drop.
unsafe impl Send for PlatformSemaphore {}
unsafe impl Sync for PlatformSemaphore {}

impl PlatformSemaphore {
    /// Create a semaphore with `initial` count. Fails if the name exists.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let posix_name = names::posix_name(name);
        let c_name = c_name(&posix_name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                PERMS as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem, name: posix_name })
    }

    /// Open an existing semaphore. Never creates.
    pub fn open(name: &str) -> io::Result<Self> {
        let posix_name = names::posix_name(name);
        let c_name = c_name(&posix_name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem, name: posix_name })
    }

    /// Decrement, blocking while the count is zero.
    /// Returns `Ok(false)` if `timeout_ms` elapsed first.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        let deadline = timeout_ms.map(deadline_after);
        loop {
            let ret = match &deadline {
                None => unsafe { libc::sem_wait(self.sem) },
                Some(ts) => unsafe { libc::sem_timedwait(self.sem, ts) },
            };
            if ret == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn value(&self) -> io::Result<i32> {
        let mut v: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut v) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(v)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = c_name(&names::posix_name(name)) {
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

// ---------------------------------------------------------------------------
// PlatformMsgQueue: POSIX message queue of fixed-size messages
// ---------------------------------------------------------------------------

pub struct PlatformMsgQueue {
    mqd: libc::mqd_t,
    name: String,
    msg_size: usize,
}

// Safety: mq_send / mq_receive are thread-safe on a shared descriptor.
unsafe impl Send for PlatformMsgQueue {}
unsafe impl Sync for PlatformMsgQueue {}

impl PlatformMsgQueue {
    /// Open the queue, creating it with `capacity` slots of `msg_size` bytes
    /// if it does not exist yet.
    pub fn create_or_open(name: &str, capacity: usize, msg_size: usize) -> io::Result<Self> {
        let posix_name = names::posix_name(name);
        let c_name = c_name(&posix_name)?;
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = capacity as libc::c_long;
        attr.mq_msgsize = msg_size as libc::c_long;
        let mqd = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                PERMS as libc::c_uint,
                &attr as *const libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(io::Error::last_os_error());
        }
        let queue = Self { mqd, name: posix_name, msg_size };
        queue.check_msg_size()?;
        Ok(queue)
    }

    /// Open an existing queue. Fails with `NotFound` if nobody created it yet.
    pub fn open(name: &str, msg_size: usize) -> io::Result<Self> {
        let posix_name = names::posix_name(name);
        let c_name = c_name(&posix_name)?;
        let mqd = unsafe { libc::mq_open(c_name.as_ptr(), libc::O_RDWR) };
        if mqd == -1 {
            return Err(io::Error::last_os_error());
        }
        let queue = Self { mqd, name: posix_name, msg_size };
        queue.check_msg_size()?;
        Ok(queue)
    }

    fn check_msg_size(&self) -> io::Result<()> {
        let attr = self.attr()?;
        if attr.mq_msgsize as usize != self.msg_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "queue {} carries {}-byte messages, expected {}",
                    self.name, attr.mq_msgsize, self.msg_size
                ),
            ));
        }
        Ok(())
    }

    fn attr(&self) -> io::Result<libc::mq_attr> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        if unsafe { libc::mq_getattr(self.mqd, &mut attr) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(attr)
    }

    /// Messages currently queued.
    pub fn len(&self) -> io::Result<usize> {
        Ok(self.attr()?.mq_curmsgs as usize)
    }

    /// Enqueue `msg`, blocking while the queue is full.
    /// Returns `Ok(false)` if `timeout_ms` elapsed first.
    pub fn send(&self, msg: &[u8], timeout_ms: Option<u64>) -> io::Result<bool> {
        let deadline = timeout_ms.map(deadline_after);
        loop {
            let ret = match &deadline {
                None => unsafe {
                    libc::mq_send(self.mqd, msg.as_ptr() as *const libc::c_char, msg.len(), 0)
                },
                Some(ts) => unsafe {
                    libc::mq_timedsend(
                        self.mqd,
                        msg.as_ptr() as *const libc::c_char,
                        msg.len(),
                        0,
                        ts,
                    )
                },
            };
            if ret == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Dequeue the oldest message into `buf` (which must hold `msg_size` bytes).
    /// Returns `Ok(None)` if `timeout_ms` elapsed first.
    pub fn receive(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<Option<usize>> {
        if buf.len() < self.msg_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "receive buffer smaller than the queue message size",
            ));
        }
        let deadline = timeout_ms.map(deadline_after);
        loop {
            let ret = match &deadline {
                None => unsafe {
                    libc::mq_receive(
                        self.mqd,
                        buf.as_mut_ptr() as *mut libc::c_char,
                        buf.len(),
                        ptr::null_mut(),
                    )
                },
                Some(ts) => unsafe {
                    libc::mq_timedreceive(
                        self.mqd,
                        buf.as_mut_ptr() as *mut libc::c_char,
                        buf.len(),
                        ptr::null_mut(),
                        ts,
                    )
                },
            };
            if ret >= 0 {
                return Ok(Some(ret as usize));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = c_name(&names::posix_name(name)) {
            unsafe { libc::mq_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformMsgQueue {
    fn drop(&mut self) {
        unsafe { libc::mq_close(self.mqd) };
    }
}
