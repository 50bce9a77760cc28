//! Recording `IoBackend` for driving the event loop without a kernel ring.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use jdocs_core::config::ServerConfig;
use jdocs_core::error::{Error, Result};
use jdocs_core::io_backend::{Completion, IoBackend};
use jdocs_core::timer::{Timer, TimerWheel};
use jdocs_core::token::{Op, Token};

use crate::buffer::SendBuffers;
use crate::connection::{ConnIo, ConnMeta};
use crate::protocol::{Protocol, ProtocolHandler};
use crate::server::Shared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepped {
    AcceptMultishot { listen_fd: RawFd, token: Token },
    FdPass { target_ring: RawFd, slot: u32, token: Token, close_token: Token },
    RecvMultishot { slot: u32, bgid: u16, token: Token },
    SendZc { slot: u32, buf_index: u16, token: Token, link: bool, data: Vec<u8> },
    CancelFd { slot: u32, token: Token },
    ShutdownClose { slot: u32, shutdown_token: Token, close_token: Token },
    Close { slot: u32, token: Token },
    MsgRing { target_ring: RawFd, data: Token, result: i32, token: Token },
    TimeoutAt { deadline: Instant, token: Token },
}

impl Prepped {
    pub fn op(&self) -> Option<Op> {
        match self {
            Prepped::AcceptMultishot { token, .. }
            | Prepped::FdPass { token, .. }
            | Prepped::RecvMultishot { token, .. }
            | Prepped::SendZc { token, .. }
            | Prepped::CancelFd { token, .. }
            | Prepped::Close { token, .. }
            | Prepped::MsgRing { token, .. }
            | Prepped::TimeoutAt { token, .. } => token.op(),
            Prepped::ShutdownClose { shutdown_token, .. } => shutdown_token.op(),
        }
    }
}

pub struct RecordingBackend {
    pub ring_fd: RawFd,
    pub prepped: Vec<Prepped>,
    pub ready: VecDeque<Completion>,
    pub send_table: u32,
    pub send_registered: u32,
    pub buf_rings: Vec<(u16, u16)>,
    /// Fail `register_send_buffers` once this many slots are registered.
    pub send_register_limit: Option<u32>,
}

impl RecordingBackend {
    pub fn new(ring_fd: RawFd) -> Self {
        Self {
            ring_fd,
            prepped: Vec::new(),
            ready: VecDeque::new(),
            send_table: 0,
            send_registered: 0,
            buf_rings: Vec::new(),
            send_register_limit: None,
        }
    }

    pub fn take(&mut self) -> Vec<Prepped> {
        std::mem::take(&mut self.prepped)
    }

    pub fn count(&self, op: Op) -> usize {
        self.prepped.iter().filter(|p| p.op() == Some(op)).count()
    }
}

impl IoBackend for RecordingBackend {
    fn ring_fd(&self) -> RawFd {
        self.ring_fd
    }

    fn submit(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn submit_and_wait(&mut self, _want: usize) -> io::Result<usize> {
        if self.ready.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::ETIME));
        }
        Ok(self.ready.len())
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>) -> usize {
        let n = self.ready.len();
        out.extend(self.ready.drain(..));
        n
    }

    fn prep_accept_multishot(&mut self, listen_fd: RawFd, token: Token) -> Result<()> {
        self.prepped.push(Prepped::AcceptMultishot { listen_fd, token });
        Ok(())
    }

    fn prep_fd_pass(
        &mut self,
        target_ring: RawFd,
        slot: u32,
        token: Token,
        close_token: Token,
    ) -> Result<()> {
        self.prepped.push(Prepped::FdPass { target_ring, slot, token, close_token });
        Ok(())
    }

    fn prep_recv_multishot(&mut self, slot: u32, bgid: u16, token: Token) -> Result<()> {
        self.prepped.push(Prepped::RecvMultishot { slot, bgid, token });
        Ok(())
    }

    unsafe fn prep_send_zc(
        &mut self,
        slot: u32,
        buf: *const u8,
        len: u32,
        buf_index: u16,
        token: Token,
        link: bool,
    ) -> Result<()> {
        let data = unsafe { std::slice::from_raw_parts(buf, len as usize) }.to_vec();
        self.prepped.push(Prepped::SendZc { slot, buf_index, token, link, data });
        Ok(())
    }

    fn prep_cancel_fd(&mut self, slot: u32, token: Token) -> Result<()> {
        self.prepped.push(Prepped::CancelFd { slot, token });
        Ok(())
    }

    fn prep_shutdown_close(
        &mut self,
        slot: u32,
        shutdown_token: Token,
        close_token: Token,
    ) -> Result<()> {
        self.prepped.push(Prepped::ShutdownClose { slot, shutdown_token, close_token });
        Ok(())
    }

    fn prep_close(&mut self, slot: u32, token: Token) -> Result<()> {
        self.prepped.push(Prepped::Close { slot, token });
        Ok(())
    }

    fn prep_msg_ring(
        &mut self,
        target_ring: RawFd,
        data: Token,
        result: i32,
        token: Token,
    ) -> Result<()> {
        self.prepped.push(Prepped::MsgRing { target_ring, data, result, token });
        Ok(())
    }

    fn prep_timeout_at(&mut self, deadline: Instant, token: Token) -> Result<()> {
        self.prepped.push(Prepped::TimeoutAt { deadline, token });
        Ok(())
    }


    unsafe fn register_buf_ring(&mut self, _ring_addr: u64, entries: u16, bgid: u16) -> Result<()> {
        self.buf_rings.push((entries, bgid));
        Ok(())
    }

    fn register_send_table(&mut self, nr: u32) -> Result<()> {
        self.send_table = nr;
        Ok(())
    }

    unsafe fn register_send_buffers(
        &mut self,
        offset: u32,
        iovecs: &[libc::iovec],
        tags: &[u64],
    ) -> Result<()> {
        assert_eq!(iovecs.len(), tags.len());
        let end = offset + iovecs.len() as u32;
        if end > self.send_table {
            return Err(Error::Registration {
                what: "fixed buffers",
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        if let Some(limit) = self.send_register_limit {
            if end > limit {
                return Err(Error::Registration {
                    what: "fixed buffers",
                    source: io::Error::from_raw_os_error(libc::ENOMEM),
                });
            }
        }
        self.send_registered = end;
        Ok(())
    }
}

/// One connection's worth of loop state, for driving protocol handlers directly.
pub struct Harness {
    pub backend: RecordingBackend,
    pub send: SendBuffers,
    pub meta: ConnMeta,
    pub wheel: TimerWheel<u32>,
    pub timer: Timer<u32>,
    pub shared: Shared,
}

impl Harness {
    /// Connection 1 on slot 5, one worker whose ring is 100.
    pub fn new() -> Self {
        Self::with_workers(1)
    }

    /// Worker `i` gets ring `100 + i`.
    pub fn with_workers(workers: usize) -> Self {
        let mut backend = RecordingBackend::new(100);
        let send = SendBuffers::new(&mut backend).expect("send pool");
        let wheel = TimerWheel::new(Duration::from_millis(100));
        let timer = wheel.timer(1);
        let rings = (0..workers).map(|i| 100 + i as RawFd).collect();
        Self {
            backend,
            send,
            meta: ConnMeta::new(1, 5),
            wheel,
            timer,
            shared: Shared::new(ServerConfig::new(), rings),
        }
    }

    pub fn with_io<R>(&mut self, f: impl FnOnce(&mut ConnIo<'_, RecordingBackend>) -> R) -> R {
        let mut io = ConnIo::new(&mut self.backend, &mut self.send, &mut self.meta, &self.timer, &self.shared);
        f(&mut io)
    }

    /// Feed received bytes; returns the replacement handler if the stage changed.
    pub fn recv(&mut self, protocol: &mut Protocol, data: &[u8]) -> Option<Protocol> {
        let mut io = ConnIo::new(&mut self.backend, &mut self.send, &mut self.meta, &self.timer, &self.shared);
        protocol.on_recv(&mut io, data).expect("on_recv");
        io.take_upgrade()
    }

    /// Deliver a cross-thread payload.
    pub fn message(&mut self, protocol: &mut Protocol, payload: &[u8]) {
        let mut io = ConnIo::new(&mut self.backend, &mut self.send, &mut self.meta, &self.timer, &self.shared);
        protocol.on_message(&mut io, payload).expect("on_message");
    }
}
