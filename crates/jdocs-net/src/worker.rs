//! Worker threads. Each owns one ring, one event loop and its connections.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info};

use jdocs_core::config::ServerConfig;
use jdocs_core::error::{Error, Result};
use jdocs_core::io_backend::IoBackend;

use crate::event_loop::EventLoop;
use crate::server::{self, Shared};
use crate::uring::{UringBackend, UringConfig};

/// A started thread whose ring exists but which has not been given the shared state yet.
pub struct Worker {
    index: usize,
    ring_fd: RawFd,
    shared_tx: Sender<Arc<Shared>>,
    thread: JoinHandle<()>,
}

impl Worker {
    /// Start thread `jdocs-worker-{index}` and wait for its ring.
    pub fn spawn(index: usize, config: &ServerConfig) -> Result<Self> {
        let uring = UringConfig { sq_entries: config.queue_depth, fd_table_size: config.fd_table_size };
        let (ring_tx, ring_rx) = bounded::<Result<RawFd>>(1);
        let (shared_tx, shared_rx) = bounded::<Arc<Shared>>(1);

        let thread = thread::Builder::new()
            .name(format!("jdocs-worker-{}", index))
            .spawn(move || worker_main(index, uring, ring_tx, shared_rx))
            .map_err(Error::WorkerSpawn)?;

        let ring_fd = match ring_rx.recv() {
            Ok(res) => res?,
            Err(_) => return Err(Error::WorkerStartup(format!("worker {index} exited during setup"))),
        };
        debug!(worker = index, ring_fd, "worker ring ready");
        Ok(Self { index, ring_fd, shared_tx, thread })
    }

    #[inline]
    pub fn ring_fd(&self) -> RawFd {
        self.ring_fd
    }

    /// Hand over the shared state; the worker starts its loop.
    pub fn start(self, shared: Arc<Shared>) -> Result<WorkerHandle> {
        self.shared_tx
            .send(shared)
            .map_err(|_| Error::WorkerStartup(format!("worker {} is gone", self.index)))?;
        Ok(WorkerHandle { index: self.index, thread: self.thread })
    }
}

pub struct WorkerHandle {
    index: usize,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            error!(worker = self.index, "worker thread panicked");
        }
    }
}

fn worker_main(
    index: usize,
    uring: UringConfig,
    ring_tx: Sender<Result<RawFd>>,
    shared_rx: Receiver<Arc<Shared>>,
) {
    let backend = match UringBackend::new(uring) {
        Ok(b) => b,
        Err(e) => {
            let _ = ring_tx.send(Err(e));
            return;
        }
    };
    if ring_tx.send(Ok(backend.ring_fd())).is_err() {
        return;
    }
    // Dropped sender means the server gave up during startup.
    let Ok(shared) = shared_rx.recv() else {
        return;
    };

    let result = EventLoop::worker(backend, index, shared.clone()).and_then(|mut el| el.run());
    match result {
        Ok(()) => info!(worker = index, "worker stopped"),
        Err(e) => {
            error!(worker = index, error = %e, "worker loop failed");
            // The listener only wakes for accepts; bring every loop down.
            if let Err(e) = server::stop_all(&shared) {
                error!(worker = index, error = %e, "failed to wake other loops");
                shared.running.store(false, Ordering::Release);
            }
        }
    }
}
