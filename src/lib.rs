// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Caching content proxy and cache daemon exchanging file bytes over POSIX
// shared memory. The proxy publishes fill requests on a message queue; the
// daemon stages file contents chunk by chunk into proxy-owned segments, and
// a named semaphore pair per segment passes the turn back and forth.

#[cfg(not(target_os = "linux"))]
compile_error!("shmproxy needs POSIX message queues and named semaphores (Linux)");

pub mod names;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod semaphore;
pub use semaphore::IpcSemaphore;

pub mod error;
pub use error::{Error, Result};

pub mod segment;
pub use segment::{SegmentStatus, SharedSegment, HEADER_SIZE};

pub mod handshake;
pub use handshake::{Handshake, SemaphorePair};

pub mod command;
pub use command::{Command, CommandChannel, Record};

pub mod pool;
pub use pool::{SegmentPool, Slot};

mod work_queue;
pub use work_queue::RequestQueue;

pub mod protocol;
pub use protocol::{Delivery, FillOutcome};

pub mod store;
pub use store::{ContentReader, ContentStore, DirectoryStore, IndexedStore, MemoryStore};

pub mod gateway;
pub use gateway::{GatewayServer, MemorySink, RequestHandler, ResponseSink, ResponseStatus};

pub mod config;
pub use config::{DaemonConfig, ProxyConfig, TimeoutPolicy};

pub mod proxy;
pub use proxy::CacheProxy;

pub mod daemon;
pub use daemon::{CacheDaemon, DaemonShutdown};

pub mod logging;
