// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// GETFILE proxy answering requests from the cache daemon through shared
// memory segments.
//
// Usage: shmproxy [-p port] [-t threads] [-n segments] [-z segment-size]

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use shmproxy::config::{DEFAULT_PORT, SERVER_FAILURE};
use shmproxy::{logging, names, CacheProxy, GatewayServer, ProxyConfig, TimeoutPolicy};

#[derive(Parser, Debug)]
#[command(name = "shmproxy")]
#[command(about = "GETFILE proxy served from a cache daemon over shared memory")]
struct Args {
    /// Listen port (at least 1024).
    #[arg(short, long, env = "SHMPROXY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Worker threads serving clients (1-1024).
    #[arg(short = 't', long = "thread-count", env = "SHMPROXY_THREAD_COUNT", default_value_t = 1)]
    thread_count: usize,

    /// Number of shared memory segments.
    #[arg(short = 'n', long, env = "SHMPROXY_SEGMENT_COUNT", default_value_t = 4)]
    segment_count: usize,

    /// Data bytes per segment.
    #[arg(short = 'z', long, env = "SHMPROXY_SEGMENT_SIZE", default_value_t = 4096)]
    segment_size: usize,

    /// Command channel name.
    #[arg(long, env = "SHMPROXY_CHANNEL", default_value = names::CMD_CHANNEL)]
    channel: String,

    /// Seconds to wait for the cache daemon per round; 0 waits forever.
    #[arg(long, env = "SHMPROXY_TIMEOUT_SECS", default_value_t = 20)]
    timeout_secs: u64,

    /// What to do when the cache daemon misses the deadline.
    #[arg(long, env = "SHMPROXY_TIMEOUT_POLICY", value_enum, default_value_t = TimeoutPolicy::Fatal)]
    timeout_policy: TimeoutPolicy,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, env = "SHMPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_port: self.port,
            worker_count: self.thread_count,
            segment_count: self.segment_count,
            segment_size: self.segment_size,
            channel_name: self.channel.clone(),
            ready_timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            timeout_policy: self.timeout_policy,
            ..ProxyConfig::default()
        }
    }
}

fn run(args: &Args) -> shmproxy::Result<()> {
    let config = args.config();
    let port = config.listen_port;
    let workers = config.worker_count;
    let proxy = Arc::new(CacheProxy::start(config)?);
    let server = GatewayServer::bind(("0.0.0.0", port), workers)?;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let stop = server.stop_flag();
    let signal_proxy = Arc::clone(&proxy);
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let mut received = 0;
            for sig in signals.forever() {
                received += 1;
                if received > 1 {
                    std::process::exit(128 + sig);
                }
                info!(signal = sig, "shutting down");
                signal_proxy.cleanup();
                stop.store(true, Ordering::Release);
            }
        })?;

    server.serve(Arc::clone(&proxy))?;
    proxy.cleanup();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(SERVER_FAILURE as u8)
        }
    }
}
