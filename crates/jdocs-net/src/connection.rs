//! Per-connection state and the I/O context handed to protocol handlers.
//!
//! A [`Connection`] lives in exactly one worker's map, keyed by its id.
//! Handlers never see the event loop; they get a [`ConnIo`] that exposes the
//! only operations outer layers may issue.

use std::time::Duration;

use tracing::{debug, trace};

use jdocs_core::constants::RECV_BUFFER_GROUP;
use jdocs_core::envelope::Delivery;
use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;
use jdocs_core::registry::UserDirectory;
use jdocs_core::timer::Timer;
use jdocs_core::token::{Op, Token};

use crate::buffer::SendBuffers;
use crate::protocol::ProtocolHandler;
use crate::service::DocumentStore;
use crate::protocol::Protocol;
use crate::server::Shared;

/// Protocol stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Http,
    WebSocket,
}

/// Everything about a connection except its handler.
#[derive(Debug)]
pub struct ConnMeta {
    pub id: u32,
    /// Direct descriptor slot on the owning worker's ring.
    pub fd: u32,
    pub closed: bool,
    pub recv_bytes: u64,
    pub sent_bytes: u64,
    pub stage: Stage,
    pub user_id: Option<u32>,
}

impl ConnMeta {
    pub fn new(id: u32, fd: u32) -> Self {
        Self {
            id,
            fd,
            closed: false,
            recv_bytes: 0,
            sent_bytes: 0,
            stage: Stage::Http,
            user_id: None,
        }
    }

    /// Start teardown: cancel everything in flight on the descriptor.
    ///
    /// Returns false if teardown was already underway.
    pub fn begin_close<B: IoBackend>(&mut self, timer: &Timer<u32>, backend: &mut B) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        self.closed = true;
        timer.cancel();
        backend.prep_cancel_fd(self.fd, Token::new(Op::Cancel, self.id, self.fd, 0))?;
        debug!(conn_id = self.id, fd = self.fd, "closing connection");
        Ok(true)
    }
}

pub struct Connection {
    pub meta: ConnMeta,
    pub protocol: Protocol,
    pub timer: Timer<u32>,
}

impl Connection {
    pub fn new(id: u32, fd: u32, timer: Timer<u32>) -> Self {
        Self { meta: ConnMeta::new(id, fd), protocol: Protocol::http(), timer }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.meta.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.meta.closed
    }

    /// Idempotent; only the first call submits a cancel.
    pub fn close<B: IoBackend>(&mut self, backend: &mut B) -> Result<bool> {
        self.meta.begin_close(&self.timer, backend)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("meta", &self.meta)
            .field("stage", &self.protocol.stage())
            .finish()
    }
}

/// I/O surface for protocol handlers, scoped to one connection.
pub struct ConnIo<'a, B: IoBackend> {
    backend: &'a mut B,
    send: &'a mut SendBuffers,
    meta: &'a mut ConnMeta,
    timer: &'a Timer<u32>,
    shared: &'a Shared,
    upgrade: Option<Protocol>,
}

impl<'a, B: IoBackend> ConnIo<'a, B> {
    pub(crate) fn new(
        backend: &'a mut B,
        send: &'a mut SendBuffers,
        meta: &'a mut ConnMeta,
        timer: &'a Timer<u32>,
        shared: &'a Shared,
    ) -> Self {
        Self { backend, send, meta, timer, shared, upgrade: None }
    }

    #[inline]
    pub fn conn_id(&self) -> u32 {
        self.meta.id
    }

    #[inline]
    pub fn user_id(&self) -> Option<u32> {
        self.meta.user_id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.meta.closed
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.shared.directory
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.shared.documents
    }

    /// Re-arm the multishot receive.
    pub fn submit_recv(&mut self) -> Result<()> {
        if self.meta.closed {
            return Ok(());
        }
        let token = Token::new(Op::Recv, self.meta.id, self.meta.fd, 0);
        self.backend.prep_recv_multishot(self.meta.fd, RECV_BUFFER_GROUP, token)
    }

    pub fn acquire_send_buffer(&mut self) -> Option<u16> {
        self.send.acquire(&mut *self.backend)
    }

    pub fn send_buffer_mut(&mut self, idx: u16) -> Option<&mut [u8]> {
        self.send.buffer_mut(idx)
    }

    /// Zero-copy send of the first `len` bytes of buffer `idx`.
    ///
    /// On a closed connection the buffer is released and nothing is sent.
    pub fn submit_send_zc(&mut self, idx: u16, len: usize, link: bool) -> Result<()> {
        if self.meta.closed {
            self.send.release(idx);
            return Ok(());
        }
        let Some(ptr) = self.send.buffer_ptr(idx) else {
            return Ok(());
        };
        let token = Token::new(Op::SendZc, self.meta.id, self.meta.fd, idx as u32);
        trace!(conn_id = self.meta.id, buf = idx, len, link, "send_zc");
        // The buffer stays checked out until its notification completion.
        unsafe {
            self.backend
                .prep_send_zc(self.meta.fd, ptr, len as u32, idx, token, link)
        }
    }

    /// Acquire a buffer, let `fill` write into it, and send what it wrote.
    ///
    /// Returns false (and closes the connection) if no send buffer is available.
    pub fn send_with<F>(&mut self, link: bool, fill: F) -> Result<bool>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        if self.meta.closed {
            return Ok(false);
        }
        let Some(idx) = self.acquire_send_buffer() else {
            debug!(conn_id = self.meta.id, "no send buffer available");
            self.close()?;
            return Ok(false);
        };
        let len = match self.send.buffer_mut(idx) {
            Some(buf) => fill(buf),
            None => 0,
        };
        self.submit_send_zc(idx, len, link)?;
        Ok(true)
    }

    pub fn close(&mut self) -> Result<()> {
        self.meta.begin_close(self.timer, &mut *self.backend)?;
        Ok(())
    }

    /// Hand each delivery to the worker owning its destination.
    ///
    /// The delivery is queued first, then the owner's ring is poked, so the
    /// wake-up completion always finds it.
    pub fn submit_cross_thread(&mut self, deliveries: Vec<Delivery>) -> Result<usize> {
        let mut sent = 0;
        for delivery in deliveries {
            let dest = delivery.dest();
            let owner = self.shared.router.owner_of(dest);
            let (Some(mailbox), Some(&ring)) =
                (self.shared.mailboxes.get(owner), self.shared.ring_fds.get(owner))
            else {
                continue;
            };
            mailbox.push(delivery);
            self.backend.prep_msg_ring(
                ring,
                Token::new(Op::CrossMsg, dest, 0, 0),
                0,
                Token::new(Op::Nop, self.meta.id, 0, 0),
            )?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Re-arm this connection's idle timer.
    pub fn add_timer(&mut self, after: Duration) {
        if !self.meta.closed {
            self.timer.arm(after);
        }
    }

    pub fn bind_user(&mut self, user_id: u32) {
        if let Some(prev) = self.shared.directory.bind(user_id, self.meta.id) {
            debug!(user_id, prev_conn = prev, conn_id = self.meta.id, "user rebound");
        }
        self.meta.user_id = Some(user_id);
    }

    /// Replace the connection's handler once the current callback returns.
    pub fn upgrade(&mut self, protocol: Protocol) {
        self.meta.stage = protocol.stage();
        self.upgrade = Some(protocol);
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<Protocol> {
        self.upgrade.take()
    }
}
