// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// GETFILE front end: accepts client connections, parses the request line and
// hands the path to a `RequestHandler` together with a sink for the response.
//
//   request:   GETFILE GET <path>\r\n\r\n
//   responses: GETFILE OK <len>\r\n\r\n<body>
//              GETFILE FILE_NOT_FOUND\r\n\r\n
//              GETFILE ERROR\r\n\r\n
//              GETFILE INVALID\r\n\r\n

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::work_queue::RequestQueue;

/// Longest request header accepted, terminator included.
pub const MAX_REQUEST_HEADER: usize = 4096;

const SCHEME: &str = "GETFILE";
const TERMINATOR: &[u8] = b"\r\n\r\n";
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    FileNotFound,
    Error,
    Invalid,
}

impl ResponseStatus {
    fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Ok => "OK",
            ResponseStatus::FileNotFound => "FILE_NOT_FOUND",
            ResponseStatus::Error => "ERROR",
            ResponseStatus::Invalid => "INVALID",
        }
    }
}

/// Render a response header. Only `Ok` carries the content length.
pub fn format_header(status: ResponseStatus, content_length: u64) -> String {
    match status {
        ResponseStatus::Ok => format!("{SCHEME} OK {content_length}\r\n\r\n"),
        other => format!("{SCHEME} {}\r\n\r\n", other.as_str()),
    }
}

/// Where a handler writes its response.
///
/// `send_header` must be called exactly once, before any `send_bytes`.
pub trait ResponseSink {
    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> io::Result<()>;

    /// Forward body bytes. Returns how many were accepted.
    fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn header_sent(&self) -> bool;
}

/// Serves one request path. Returns the number of body bytes sent.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, path: &str, sink: &mut dyn ResponseSink) -> Result<u64>;
}

impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    fn handle(&self, path: &str, sink: &mut dyn ResponseSink) -> Result<u64> {
        (**self).handle(path, sink)
    }
}

fn header_twice() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "response header already sent")
}

fn body_before_header() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "body bytes before response header")
}

/// Collects a response in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    status: Option<ResponseStatus>,
    content_length: u64,
    body: Vec<u8>,
    write_limit: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `limit` bytes per `send_bytes` call.
    pub fn with_write_limit(limit: usize) -> Self {
        Self {
            write_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn status(&self) -> Option<ResponseStatus> {
        self.status
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

impl ResponseSink for MemorySink {
    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> io::Result<()> {
        if self.status.is_some() {
            return Err(header_twice());
        }
        self.status = Some(status);
        self.content_length = content_length;
        Ok(())
    }

    fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            return Err(body_before_header());
        }
        let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        self.body.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn header_sent(&self) -> bool {
        self.status.is_some()
    }
}

/// Response sink over a client connection.
pub struct TcpSink<'a> {
    stream: &'a mut TcpStream,
    header_sent: bool,
}

impl<'a> TcpSink<'a> {
    pub fn new(stream: &'a mut TcpStream) -> Self {
        Self {
            stream,
            header_sent: false,
        }
    }
}

impl ResponseSink for TcpSink<'_> {
    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> io::Result<()> {
        if self.header_sent {
            return Err(header_twice());
        }
        self.stream
            .write_all(format_header(status, content_length).as_bytes())?;
        self.header_sent = true;
        Ok(())
    }

    fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.header_sent {
            return Err(body_before_header());
        }
        self.stream.write_all(buf)?;
        Ok(buf.len())
    }

    fn header_sent(&self) -> bool {
        self.header_sent
    }
}

/// Extract the path from a complete request header. `None` if malformed.
pub fn parse_request(header: &[u8]) -> Option<String> {
    if header.len() > MAX_REQUEST_HEADER {
        return None;
    }
    let line = header.strip_suffix(TERMINATOR)?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(SCHEME), Some("GET"), Some(path), None) if path.starts_with('/') => {
            Some(path.to_string())
        }
        _ => None,
    }
}

/// Read up to and including the header terminator.
///
/// `Ok(None)` if the peer closed early or the header grew past
/// [`MAX_REQUEST_HEADER`].
fn read_request_header(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while header.len() < MAX_REQUEST_HEADER {
        match stream.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                header.push(byte[0]);
                if header.ends_with(TERMINATOR) {
                    return Ok(Some(header));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn serve_connection(mut stream: TcpStream, handler: &dyn RequestHandler) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    if let Err(e) = stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT)) {
        warn!(%peer, "set_read_timeout: {e}");
    }

    let path = match read_request_header(&mut stream) {
        Ok(Some(header)) => parse_request(&header),
        Ok(None) => None,
        Err(e) => {
            debug!(%peer, "reading request: {e}");
            return;
        }
    };

    let mut sink = TcpSink::new(&mut stream);
    match path {
        None => {
            debug!(%peer, "invalid request");
            if let Err(e) = sink.send_header(ResponseStatus::Invalid, 0) {
                debug!(%peer, "sending INVALID: {e}");
            }
        }
        Some(path) => match handler.handle(&path, &mut sink) {
            Ok(bytes) => debug!(%peer, %path, bytes, "request served"),
            Err(e) => {
                warn!(%peer, %path, "request failed: {e}");
                if !sink.header_sent() {
                    if let Err(e) = sink.send_header(ResponseStatus::Error, 0) {
                        debug!(%peer, "sending ERROR: {e}");
                    }
                }
            }
        },
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Listening socket plus a fixed pool of connection workers.
pub struct GatewayServer {
    listener: TcpListener,
    worker_count: usize,
    stop: Arc<AtomicBool>,
}

impl GatewayServer {
    pub fn bind(addr: impl ToSocketAddrs, worker_count: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            worker_count: worker_count.max(1),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Ask `serve` to return. Connections already queued are still served.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// A flag that stops `serve` when raised, for use from other threads.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Accept connections until [`shutdown`](GatewayServer::shutdown).
    pub fn serve<H: RequestHandler + 'static>(&self, handler: Arc<H>) -> Result<()> {
        let queue: Arc<RequestQueue<TcpStream>> = Arc::new(RequestQueue::new());
        let mut workers = Vec::with_capacity(self.worker_count);
        for i in 0..self.worker_count {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let worker = thread::Builder::new()
                .name(format!("gateway-worker-{i}"))
                .spawn(move || {
                    while let Some(stream) = queue.pop() {
                        serve_connection(stream, handler.as_ref());
                    }
                })?;
            workers.push(worker);
        }
        info!(addr = ?self.local_addr().ok(), workers = self.worker_count, "gateway listening");

        let result = self.accept_loop(&queue);

        queue.close();
        for worker in workers {
            if worker.join().is_err() {
                warn!("gateway worker panicked");
            }
        }
        info!("gateway stopped");
        result
    }

    fn accept_loop(&self, queue: &RequestQueue<TcpStream>) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    if queue.push(stream).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        Ok(())
    }
}
