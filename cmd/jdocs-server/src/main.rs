//! jdocs server binary.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use tracing::{error, info, warn};

use jdocs_core::config::ServerConfig;
use jdocs_net::{Server, StopHandle};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "jdocs")]
#[command(about = "WebSocket chat server on io_uring")]
#[command(version)]
struct Args {
    /// TCP port to listen on (all interfaces)
    #[arg(short, long, env = "JDOCS_PORT")]
    port: Option<u16>,

    /// Worker threads; 0 uses one per CPU
    #[arg(short, long, env = "JDOCS_WORKERS")]
    workers: Option<usize>,

    /// Close connections idle for this long
    #[arg(long, env = "JDOCS_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: Option<u64>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, env = "JDOCS_LOG")]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(workers) = self.workers {
            config = config.workers(workers);
        }
        if let Some(ms) = self.idle_timeout_ms {
            config = config.idle_timeout(Duration::from_millis(ms));
        }
        if let Some(level) = self.log_level {
            config = config.log_level(level);
        }
        config
    }
}

fn main() -> ExitCode {
    let config = Args::parse().into_config();
    logging::init(&config.log_level);

    // Workers inherit this mask, so only the signal thread sees SIGINT/SIGTERM.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    if let Err(e) = mask.thread_block() {
        error!(error = %e, "failed to block signals");
        return ExitCode::FAILURE;
    }
    if let Err(e) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        warn!(error = %e, "failed to ignore SIGPIPE");
    }

    let mut server = match Server::bind(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "server startup failed");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = spawn_signal_thread(mask, server.stop_handle()) {
        error!(error = %e, "failed to start signal thread");
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => {
            info!("server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_thread(mask: SigSet, stop: StopHandle) -> std::io::Result<()> {
    thread::Builder::new().name("jdocs-signal".into()).spawn(move || {
        let mut stopping = false;
        loop {
            match mask.wait() {
                Ok(sig) if stopping => {
                    warn!(signal = ?sig, "second signal, exiting immediately");
                    std::process::exit(1);
                }
                Ok(sig) => {
                    info!(signal = ?sig, "shutdown requested");
                    stopping = true;
                    if let Err(e) = stop.stop() {
                        error!(error = %e, "failed to stop server");
                    }
                }
                Err(e) => {
                    error!(error = %e, "sigwait failed");
                    return;
                }
            }
        }
    })?;
    Ok(())
}
