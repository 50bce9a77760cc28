//! Process-wide server: listener socket, worker threads and the state they share.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use jdocs_core::config::ServerConfig;
use jdocs_core::envelope::Mailbox;
use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;
use jdocs_core::registry::{ShardRouter, UserDirectory};
use jdocs_core::token::{Op, Token};

use crate::event_loop::EventLoop;
use crate::listener::Listener;
use crate::service::DocumentStore;
use crate::uring::{UringBackend, UringConfig};
use crate::worker::{Worker, WorkerHandle};

/// State visible to every loop. Read-mostly; `directory`, `documents` and
/// `running` are the only parts that change.
#[derive(Debug)]
pub struct Shared {
    pub running: AtomicBool,
    pub router: ShardRouter,
    /// Worker ring descriptors, indexed by worker.
    pub ring_fds: Vec<RawFd>,
    pub listener_ring: Option<RawFd>,
    /// Cross-thread inboxes, indexed by worker.
    pub mailboxes: Vec<Mailbox>,
    pub directory: UserDirectory,
    pub documents: DocumentStore,
    pub config: ServerConfig,
}

impl Shared {
    pub fn new(config: ServerConfig, ring_fds: Vec<RawFd>) -> Self {
        let workers = ring_fds.len();
        Self {
            running: AtomicBool::new(true),
            router: ShardRouter::new(workers),
            mailboxes: (0..workers).map(|_| Mailbox::new()).collect(),
            ring_fds,
            listener_ring: None,
            directory: UserDirectory::new(),
            documents: DocumentStore::new(),
            config,
        }
    }

    pub fn with_listener_ring(mut self, ring: RawFd) -> Self {
        self.listener_ring = Some(ring);
        self
    }

    /// Every ring a loop may be blocked on: the workers', then the listener's.
    pub fn rings(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.ring_fds.iter().copied().chain(self.listener_ring)
    }

    /// Clear the running flag and post a no-op message to every ring through
    /// `backend`. Wakes the rings even if the flag was already clear.
    pub fn stop<B: IoBackend>(&self, backend: &mut B) -> Result<usize> {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("shutting down");
        }
        let wake = Token::new(Op::Nop, 0, 0, 0);
        let mut woken = 0;
        for ring in self.rings() {
            backend.prep_msg_ring(ring, wake, 0, wake)?;
            woken += 1;
        }
        backend.submit()?;
        Ok(woken)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.ring_fds.len()
    }
}

pub struct Server {
    shared: Arc<Shared>,
    listener: Listener,
    backend: Option<UringBackend>,
    workers: Vec<WorkerHandle>,
}

impl Server {
    /// Bind the port and start every worker. Workers are running on return.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = Listener::bind(config.port, config.backlog)?;
        let uring = UringConfig { sq_entries: config.queue_depth, fd_table_size: config.fd_table_size };
        let backend = UringBackend::new(uring)?;
        let listener_ring = backend.ring_fd();

        let count = config.resolved_workers();
        let mut pending = Vec::with_capacity(count);
        for index in 0..count {
            pending.push(Worker::spawn(index, &config)?);
        }
        let ring_fds = pending.iter().map(|w| w.ring_fd()).collect();
        let shared = Arc::new(Shared::new(config, ring_fds).with_listener_ring(listener_ring));
        let workers = pending
            .into_iter()
            .map(|w| w.start(shared.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(
            port = shared.config.port,
            workers = count,
            addr = %listener.local_addr(),
            "server listening"
        );
        Ok(Self { shared, listener, backend: Some(backend), workers })
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }

    /// A handle that can stop the server from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { shared: self.shared.clone() }
    }

    /// Run the accept loop on the calling thread until shutdown.
    pub fn run(&mut self) -> Result<()> {
        let Some(backend) = self.backend.take() else {
            warn!("listener loop already ran");
            return Ok(());
        };
        let mut event_loop = EventLoop::listener(backend, self.shared.clone(), self.listener.as_raw_fd());
        let result = event_loop.run();
        if let Err(e) = &result {
            error!(error = %e, "listener loop failed");
        }
        self.shutdown();
        result
    }

    /// Stop every loop. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Err(e) = self.stop_handle().stop() {
            warn!(error = %e, "failed to wake loops");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

/// Clears the running flag and wakes every ring so blocked loops notice.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<()> {
        stop_all(&self.shared)
    }
}

/// [`Shared::stop`] through a short-lived ring of our own.
pub(crate) fn stop_all(shared: &Shared) -> Result<()> {
    let config = UringConfig { sq_entries: 64, fd_table_size: 1 };
    let mut backend = UringBackend::new(config)?;
    shared.stop(&mut backend)?;
    Ok(())
}
