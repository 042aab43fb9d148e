// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cache daemon: serves files from a directory or an index file into the
// proxy's shared memory segments.
//
// Usage: shmcached [-c cachedir|index] [-t threads]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use shmproxy::store::{self, ContentStore};
use shmproxy::{logging, names, CacheDaemon, CommandChannel, DaemonConfig};

#[derive(Parser, Debug)]
#[command(name = "shmcached")]
#[command(about = "Cache daemon feeding the GETFILE proxy over shared memory")]
struct Args {
    /// Directory to serve, or an index file of `<request-path> <local-file>` lines.
    #[arg(short = 'c', long = "cachedir", env = "SHMCACHED_CACHEDIR", default_value = "locals.txt")]
    cachedir: PathBuf,

    /// Worker threads (1-31415).
    #[arg(short = 't', long = "nthreads", env = "SHMCACHED_NTHREADS", default_value_t = 3)]
    nthreads: usize,

    /// Command channel name.
    #[arg(long, env = "SHMCACHED_CHANNEL", default_value = names::CMD_CHANNEL)]
    channel: String,

    /// Seconds to wait for the proxy per round; 0 waits while the segment exists.
    #[arg(long, env = "SHMCACHED_RELEASE_TIMEOUT_SECS", default_value_t = 0)]
    release_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, env = "SHMCACHED_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn run(args: &Args) -> shmproxy::Result<()> {
    let store: Arc<dyn ContentStore> = Arc::from(store::open_store(&args.cachedir)?);
    let config = DaemonConfig {
        channel_name: args.channel.clone(),
        worker_count: args.nthreads,
        release_timeout: (args.release_timeout_secs > 0)
            .then(|| Duration::from_secs(args.release_timeout_secs)),
        ..DaemonConfig::default()
    };
    let daemon = CacheDaemon::new(config, store)?;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let shutdown = daemon.shutdown_handle();
    let channel = args.channel.clone();
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
                shutdown.shutdown();
                CommandChannel::unlink(&channel);
            }
        })?;

    info!(cache = %args.cachedir.display(), "cache daemon starting");
    daemon.run()
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
